// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bedrock_sys::MapError;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("failed to allocate a job's fiber stack: {0}")]
    Stack(#[from] MapError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] bedrock_sys::Error),
    #[error("counter pool exhausted (capacity is {0})")]
    CountersExhausted(usize),
    #[error("job slot pool exhausted: dispatching {requested} jobs would exceed the {capacity} slot limit")]
    FibersExhausted { requested: usize, capacity: usize },
}
