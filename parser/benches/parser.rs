// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parser::{h1::Request, EMPTY_HEADER};

const SHORT_REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

const TYPICAL_REQUEST: &[u8] = b"GET /static/css/app.css HTTP/1.1\r\n\
Host: example.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/124.0\r\n\
Accept: text/css,*/*;q=0.1\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Connection: keep-alive\r\n\
If-Modified-Since: Tue, 01 Jul 2025 00:00:00 GMT\r\n\
If-None-Match: \"abc123\"\r\n\r\n";

fn parse_method(c: &mut Criterion) {
    c.bench_function("parse_method", |b| {
        b.iter(|| {
            let mut headers = [EMPTY_HEADER; 16];
            let mut req = Request::new(&mut headers);
            black_box(req.parse(black_box(SHORT_REQUEST)).unwrap());
            black_box(req.method)
        })
    });
}

fn parse_target(c: &mut Criterion) {
    c.bench_function("parse_target", |b| {
        b.iter(|| {
            let mut headers = [EMPTY_HEADER; 16];
            let mut req = Request::new(&mut headers);
            black_box(req.parse(black_box(TYPICAL_REQUEST)).unwrap());
            black_box(req.target)
        })
    });
}

fn parse_version(c: &mut Criterion) {
    c.bench_function("parse_version", |b| {
        b.iter(|| {
            let mut headers = [EMPTY_HEADER; 16];
            let mut req = Request::new(&mut headers);
            black_box(req.parse(black_box(SHORT_REQUEST)).unwrap());
            black_box(req.version)
        })
    });
}

fn parse_headers(c: &mut Criterion) {
    c.bench_function("parse_headers", |b| {
        b.iter(|| {
            let mut headers = [EMPTY_HEADER; 16];
            let mut req = Request::new(&mut headers);
            black_box(req.parse(black_box(TYPICAL_REQUEST)).unwrap());
            black_box(req.num_headers)
        })
    });
}

fn parse_full_request(c: &mut Criterion) {
    c.bench_function("parse_full_request", |b| {
        b.iter(|| {
            let mut headers = [EMPTY_HEADER; 16];
            let mut req = Request::new(&mut headers);
            black_box(req.parse(black_box(TYPICAL_REQUEST)).unwrap())
        })
    });
}

criterion_group!(benches, parse_method, parse_target, parse_version, parse_headers, parse_full_request);
criterion_main!(benches);
