// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Once;
use taskrt::attrs::{ActionAttributes, NodeAttributes};
use taskrt::task::TaskBuilder;
use taskrt::{Timeout, action, group, job, node};

const JOB: u32 = 1;
const DOMAIN: u32 = 1;

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        node::initialize(DOMAIN, 0, NodeAttributes::new().max_tasks(4096)).unwrap();
        action::create(
            JOB,
            |input| {
                let x = u32::from_ne_bytes(input.args.try_into().unwrap());
                input.result.write(0, &(x * x).to_ne_bytes()).unwrap();
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();
    });
}

fn spawn_join(c: &mut Criterion) {
    setup();
    let j = job::get(JOB, DOMAIN).unwrap();

    let mut g = c.benchmark_group("spawn");
    for batch in [1u32, 64, 512] {
        g.throughput(Throughput::Elements(u64::from(batch)));
        g.bench_function(format!("batch_{batch}"), |b| {
            b.iter(|| {
                let grp = group::create(None, None).unwrap();
                for i in 0..batch {
                    TaskBuilder::new()
                        .args(i.to_ne_bytes())
                        .result_capacity(4)
                        .group(grp)
                        .start(j)
                        .unwrap();
                }
                grp.wait_all(Timeout::INFINITE).unwrap();
            });
        });
    }
    g.finish();
}

criterion_group!(benches, spawn_join);
criterion_main!(benches);
