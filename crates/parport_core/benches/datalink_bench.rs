/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    benches::datalink_bench.rs

    Benchmarks for the datalink checksum and frame encode/decode path.

*/

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parport_core::{
    config::DataLinkConfig,
    datalink::{checksum, DataLink, DataLinkMode},
};

pub fn datalink_bench(c: &mut Criterion) {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
    let config = DataLinkConfig::default();

    c.bench_function("datalink_checksum_4k", |b| {
        b.iter(|| checksum(black_box(&payload)));
    });

    c.bench_function("datalink_dot3_encode_4k", |b| {
        let mut dl = DataLink::new(DataLinkMode::Dot3, &config, Duration::from_millis(330));
        b.iter(|| dl.encode(black_box(&payload)));
    });

    c.bench_function("datalink_dot3_decode_4k", |b| {
        let mut dl = DataLink::new(DataLinkMode::Dot3, &config, Duration::from_millis(330));
        let frame = dl.encode(&payload).unwrap_or_default();
        b.iter(|| dl.decode(black_box(&frame)));
    });

    c.bench_function("datalink_dot4_encode_4k", |b| {
        let mut dl = DataLink::new(DataLinkMode::Dot4, &config, Duration::from_millis(330));
        b.iter(|| dl.encode(black_box(&payload)));
    });
}

criterion_group!(benches, datalink_bench);
criterion_main!(benches);
