// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable systems primitives, gathered from the `bedrock-*` crates into
//! one namespace. Each module here is a thin re-export; the actual types
//! and their documentation live in the crate that implements them.
//!
//! Pull in only what you need directly (e.g. `bedrock-spsc` on its own)
//! if you don't want the whole stack as a dependency — this crate exists
//! for callers who do.

pub use bedrock_alloc as alloc;
pub use bedrock_fiber as fiber;
pub use bedrock_handles as handles;
pub use bedrock_hashtable as hashtable;
pub use bedrock_jobs as jobs;
pub use bedrock_scheduler as scheduler;
pub use bedrock_spsc as spsc;
pub use bedrock_sys as sys;
pub use bedrock_util as util;
pub use bedrock_vmem as vmem;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::malloc::SystemAllocator;

    #[test]
    fn handle_pool_and_hash_table_reexports_are_usable_together() {
        let system = SystemAllocator;
        let mut pool = handles::HandlePool::<14>::new(4);
        let mut table = hashtable::HashMap::<handles::Handle<14>>::new(8, &system).unwrap();

        let h = pool.new_handle();
        assert!(table.add(1, h));
        assert_eq!(table.find(1), Some(h));
    }

    #[test]
    fn spsc_reexport_round_trips_an_item() {
        let system = alloc::malloc::SystemAllocator;
        let queue = spsc::Spsc::<u32>::new(4, &system).unwrap();
        assert!(queue.produce(7));
        assert_eq!(queue.consume(), Some(7));
    }
}
