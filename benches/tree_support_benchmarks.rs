//! Benchmarks for the tree support pipeline.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tree_support::geometry::{ExPolygon, Point, Polygon};
use tree_support::support::{
    CancellationToken, TreeSupportGenerator, TreeSupportInput, TreeSupportLayerInput,
    TreeSupportSettings,
};
use tree_support::{scale, Coord, CoordF};

fn disk(radius_mm: f64, center: Point) -> ExPolygon {
    let mut points = Vec::with_capacity(64);
    let r = scale(radius_mm) as CoordF;
    for i in 0..64 {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / 64.0;
        points.push(Point::new(
            center.x + (r * angle.cos()).round() as Coord,
            center.y + (r * angle.sin()).round() as Coord,
        ));
    }
    ExPolygon::new(Polygon::from_points(points))
}

fn floating_disk_input(layer_count: usize) -> TreeSupportInput {
    let mut layers: Vec<TreeSupportLayerInput> = (0..layer_count)
        .map(|i| TreeSupportLayerInput {
            print_z: scale((i as f64 + 1.0) * 0.2),
            ..Default::default()
        })
        .collect();

    let disk_layer = layer_count - 3;
    for l in disk_layer..layer_count {
        layers[l].outlines = vec![disk(8.0, Point::zero())];
    }
    layers[disk_layer].overhangs = vec![disk(8.0, Point::zero())];

    TreeSupportInput::new(layers)
}

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_support_generation");
    group.sample_size(10);

    for &layer_count in &[20usize, 40] {
        group.bench_with_input(
            BenchmarkId::from_parameter(layer_count),
            &layer_count,
            |b, &layer_count| {
                let input = floating_disk_input(layer_count);
                b.iter(|| {
                    let generator = TreeSupportGenerator::new(
                        TreeSupportSettings::default(),
                        input.clone(),
                    )
                    .unwrap();
                    generator.generate(&CancellationToken::new()).unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_generation);
criterion_main!(benches);
