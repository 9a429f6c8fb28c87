use activity_context::{set_default_id_format, Activity, IdFormat};
use criterion::{criterion_group, criterion_main, Criterion};

fn hierarchical_root(c: &mut Criterion) {
    set_default_id_format(IdFormat::Hierarchical);
    c.bench_function("start_stop_hierarchical_root", |b| {
        b.iter(|| {
            let activity = Activity::new("bench");
            activity.start();
            activity.stop();
        })
    });
}

fn hierarchical_child(c: &mut Criterion) {
    set_default_id_format(IdFormat::Hierarchical);
    let parent = Activity::new("parent");
    parent.start();
    c.bench_function("start_stop_hierarchical_child", |b| {
        b.iter(|| {
            let activity = Activity::new("bench");
            activity.start();
            activity.stop();
        })
    });
    parent.stop();
}

fn w3c_root(c: &mut Criterion) {
    set_default_id_format(IdFormat::W3c);
    c.bench_function("start_stop_w3c_root", |b| {
        b.iter(|| {
            let activity = Activity::new("bench");
            activity.start();
            activity.stop();
        })
    });
    set_default_id_format(IdFormat::Hierarchical);
}

criterion_group!(benches, hierarchical_root, hierarchical_child, w3c_root);
criterion_main!(benches);
