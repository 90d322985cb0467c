use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tesforge::consistency::ConsistencyAllocator;
use tesforge::formid::{FormId, MasterList};
use tesforge::plugin::{Plugin, PluginOptions};
use tesforge::record::Record;
use tesforge::signature::{Signature, EDID};
use tesforge::subrecord::{Subrecord, SubrecordRegistry};

fn build_plugin(records: u32) -> Plugin {
    let masters = vec!["Skyrim.esm".to_string(), "Update.esm".to_string()];
    let scope = MasterList::new("Bench.esp", masters);
    let weapons = (0..records).map(|i| {
        Record::new(Signature(*b"WEAP"), scope.clone(), vec![
            Subrecord::zstring(EDID, &format!("BenchSword{i}")),
            Subrecord::new(Signature(*b"KSIZ"), 2u32.to_le_bytes().to_vec()),
            Subrecord::new(Signature(*b"KWDA"), [0x0001_E718u32, 0x0100_0042].iter().flat_map(|v| v.to_le_bytes()).collect()),
            Subrecord::new(Signature(*b"DATA"), vec![0; 10]),
        ]).with_form_id(FormId::from_parts(0, 0x1000 + i, scope.clone()).unwrap())
    }).collect();
    Plugin::new("Bench.esp", "bench", "").unwrap()
        .create_or_replace_group(Signature(*b"WEAP"), weapons)
}

fn bench_parse(c: &mut Criterion) {
    let plugin = build_plugin(10_000);
    let bytes = plugin.to_bytes(
        &["Skyrim.esm".to_string(), "Update.esm".to_string()],
        &SubrecordRegistry::skyrim(),
        &ConsistencyAllocator::in_memory(),
        &PluginOptions::default(),
    ).unwrap();

    c.bench_function("parse_10k_weapons", |b| {
        b.iter(|| Plugin::parse("Bench.esp", black_box(&bytes)).unwrap())
    });
}

fn bench_render(c: &mut Criterion) {
    let plugin = build_plugin(10_000);
    let registry = SubrecordRegistry::skyrim();
    let allocator = ConsistencyAllocator::in_memory();
    let options = PluginOptions::default();
    let same = ["Skyrim.esm".to_string(), "Update.esm".to_string()];
    let swapped = ["Update.esm".to_string(), "Skyrim.esm".to_string()];

    c.bench_function("render_10k_weapons_same_masters", |b| {
        b.iter(|| plugin.to_bytes(black_box(&same), &registry, &allocator, &options).unwrap())
    });
    c.bench_function("render_10k_weapons_reindexed", |b| {
        b.iter(|| plugin.to_bytes(black_box(&swapped), &registry, &allocator, &options).unwrap())
    });
}

criterion_group!(benches, bench_parse, bench_render);
criterion_main!(benches);
