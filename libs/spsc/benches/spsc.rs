// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bedrock_alloc::malloc::SystemAllocator;
use bedrock_spsc::Spsc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn produce_consume(c: &mut Criterion) {
    let alloc = SystemAllocator;
    let q = Spsc::<u64>::new(1024, &alloc).unwrap();

    c.bench_function("spsc_produce_consume", |b| {
        b.iter(|| {
            q.produce(black_box(42));
            black_box(q.consume())
        })
    });
}

fn produce_only_until_grow(c: &mut Criterion) {
    let alloc = SystemAllocator;
    let q = Spsc::<u64>::new(64, &alloc).unwrap();

    c.bench_function("spsc_produce_with_reclaim", |b| {
        b.iter(|| {
            if !q.produce(black_box(7)) {
                q.grow();
                q.produce(black_box(7));
            }
            black_box(q.consume())
        })
    });
}

criterion_group!(benches, produce_consume, produce_only_until_grow);
criterion_main!(benches);
