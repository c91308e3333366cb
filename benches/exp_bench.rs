use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rug::Integer;

use gwexp::arith::{FftArith, SoftFft};
use gwexp::fast_exp::FastExp;
use gwexp::gerbicz::GerbiczCheckExp;
use gwexp::input::InputNum;
use gwexp::multipoint::sliding_window;
use gwexp::progress::Reporter;
use gwexp::state::{State, StateFile};
use gwexp::task::ExpConfig;

fn input_m2203() -> InputNum {
    // 2^2203 - 1, a Mersenne prime with a few hundred digits
    InputNum::new(1, 2, 2203, -1).unwrap()
}

fn bench_fast_exp(c: &mut Criterion) {
    let input = input_m2203();
    let exp = Integer::from(Integer::u_pow_u(3, 500));
    c.bench_function("fast_exp(3^(3^500), M2203)", |b| {
        b.iter(|| {
            let mut gw = SoftFft::new(&input);
            let mut driver = FastExp::new(
                input.clone(),
                black_box(exp.clone()),
                3,
                None,
                Reporter::new(),
                ExpConfig::default(),
            )
            .unwrap();
            driver.run(&mut gw).unwrap()
        });
    });
}

fn bench_sliding_window(c: &mut Criterion) {
    let input = input_m2203();
    let exp = Integer::from(Integer::u_pow_u(3, 100));
    c.bench_function("sliding_window(x^(3^100), M2203)", |b| {
        b.iter(|| {
            let mut gw = SoftFft::new(&input);
            let mut x = gw.from_integer(&Integer::from(12345u32));
            let mut table = Vec::new();
            sliding_window(&mut gw, black_box(&exp), &mut x, &mut table, false, None, None)
                .unwrap();
            gw.to_integer(&x)
        });
    });
}

fn bench_gerbicz_run(c: &mut Criterion) {
    let input = input_m2203();
    let dir = tempfile::tempdir().unwrap();
    c.bench_function("gerbicz_check(2^1000 squarings, M2203)", |b| {
        b.iter(|| {
            let work = StateFile::new(dir.path().join("bench_work.state"));
            let rec = StateFile::new(dir.path().join("bench_rec.state"));
            work.clear();
            rec.clear();
            let mut gw = SoftFft::new(&input);
            let mut driver = GerbiczCheckExp::new(
                input.clone(),
                2,
                vec![1000],
                Integer::from(3u32),
                work,
                rec,
                Reporter::new(),
                ExpConfig::default(),
            )
            .unwrap();
            driver.run(&mut gw).unwrap()
        });
    });
}

fn bench_state_save_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let file = StateFile::new(dir.path().join("bench.state"));
    let residue = Integer::from(Integer::u_pow_u(3, 10_000));
    let state = State::new(123_456, residue);

    c.bench_function("state_save_load", |b| {
        b.iter(|| {
            file.write(black_box(&state.to_record())).unwrap();
            State::from_record(&file.read().unwrap()).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_fast_exp,
    bench_sliding_window,
    bench_gerbicz_run,
    bench_state_save_load
);
criterion_main!(benches);
