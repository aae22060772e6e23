//! Dispatch overhead: direct call vs mocked call vs origin forwarding.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

#[cfg(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod run {
    use super::*;
    use remock::{mock, OriginHandle, ScopeRegistry, Shape, Value, ValueKind};

    #[inline(never)]
    extern "C" fn bench_target(a: i64, b: i64) -> i64 {
        let a = black_box(a);
        let x = a.wrapping_mul(3).wrapping_add(b);
        black_box(x.wrapping_sub(a.wrapping_mul(2)))
    }

    fn call(a: i64, b: i64) -> i64 {
        black_box(bench_target as extern "C" fn(i64, i64) -> i64)(a, b)
    }

    fn shape() -> Shape {
        Shape::new(&[ValueKind::Int, ValueKind::Int], ValueKind::Int)
    }

    pub fn bench(c: &mut Criterion) {
        c.bench_function("direct_call", |b| b.iter(|| call(black_box(3), black_box(4))));

        let reg = ScopeRegistry::new();

        let m = mock(bench_target as usize, shape())
            .method(false)
            .returns(Value::Int(42))
            .build_in(&reg);
        c.bench_function("mocked_fixed_return", |b| {
            b.iter(|| call(black_box(3), black_box(4)))
        });
        m.unpatch();

        let origin = OriginHandle::new(shape());
        let o = origin.clone();
        let m = mock(bench_target as usize, shape())
            .method(false)
            .to(move |args| o.call(args))
            .origin(&origin)
            .build_in(&reg);
        c.bench_function("mocked_origin_forward", |b| {
            b.iter(|| call(black_box(3), black_box(4)))
        });
        m.unpatch();
    }
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod run {
    use super::*;

    pub fn bench(_c: &mut Criterion) {}
}

criterion_group!(benches, run::bench);
criterion_main!(benches);
