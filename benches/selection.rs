use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver::{
    ConfigSpace, Exp3Config, GpConfig, GpSurrogate, OnlineSelector, ParamSpec,
    SurrogateObservation, ThompsonConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;

fn arms(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("arm{i}")).collect()
}

fn warmed(mut sel: OnlineSelector, arms: &[String]) -> OnlineSelector {
    // Drive past the cold-start sweep with a deterministic reward pattern.
    for i in 0..(arms.len() * 20) {
        if let Some(d) = sel.select(arms) {
            let r = ((i % 10) as f64) / 10.0;
            let _ = sel.update(&d.chosen, r);
        }
    }
    sel
}

fn bench_select_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_update");
    for &n_arms in &[2usize, 5usize, 10usize] {
        let a = arms(n_arms);

        let policies: [(&str, fn(u64) -> OnlineSelector); 3] = [
            ("ucb1", |_| OnlineSelector::ucb1()),
            ("thompson", |s| {
                OnlineSelector::thompson(ThompsonConfig::default(), s)
            }),
            ("exp3", |s| OnlineSelector::exp3(Exp3Config::default(), s)),
        ];

        for (name, make) in policies {
            let mut sel = warmed(make(7), &a);
            group.bench_with_input(BenchmarkId::new(name, n_arms), &n_arms, |b, _| {
                b.iter(|| {
                    let d = sel.select(black_box(&a)).expect("non-empty arm set");
                    let _ = sel.update(&d.chosen, 0.5);
                    black_box(d.chosen.len());
                })
            });
        }
    }
    group.finish();
}

fn bench_surrogate(c: &mut Criterion) {
    let mut group = c.benchmark_group("surrogate");
    let space = ConfigSpace::new(vec![
        ParamSpec::continuous("x", 0.0, 1.0),
        ParamSpec::continuous("y", 0.0, 1.0),
    ]);

    for &n_obs in &[10usize, 50usize, 100usize] {
        let mut rng = StdRng::seed_from_u64(3);
        let mut gp = GpSurrogate::new(GpConfig::default());
        for _ in 0..n_obs {
            let config = space.sample(&mut rng);
            let performance = 1.0 - (config[0] - 0.4).abs();
            gp.observe(SurrogateObservation {
                config,
                performance,
                problem_id: "bench".to_string(),
            });
        }

        group.bench_with_input(BenchmarkId::new("fit", n_obs), &n_obs, |b, _| {
            b.iter(|| {
                let mut gp = gp.clone();
                gp.fit().expect("fit");
                black_box(gp.is_fit());
            })
        });

        let mut fitted = gp.clone();
        fitted.fit().expect("fit");
        group.bench_with_input(BenchmarkId::new("propose", n_obs), &n_obs, |b, _| {
            b.iter(|| {
                let proposals = fitted.propose(4, black_box(&space), &mut rng);
                black_box(proposals.len());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_select_update, bench_surrogate);
criterion_main!(benches);
