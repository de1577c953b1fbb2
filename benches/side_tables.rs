use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::ptr::null_mut;

use anhang::{get_associated, set_associated, AssocKey, Host, Policy, RawObj, WeakTable};

struct NullHost;
impl Host for NullHost {
    fn retain(&self, obj: RawObj) -> RawObj { obj }
    fn release(&self, _obj: RawObj) {}
    fn autorelease(&self, obj: RawObj) -> RawObj { obj }
    fn copy_value(&self, obj: RawObj) -> RawObj { obj }
    fn is_deallocating(&self, _obj: RawObj) -> bool { false }
    fn set_has_associated_objects(&self, _obj: RawObj) {}
    fn class_name(&self, _obj: RawObj) -> String { "Bench".into() }
}

fn bench_assoc_churn(c: &mut Criterion) {
    let host = NullHost;
    let mut objects: Vec<u64> = (0..1024).collect();
    static KEY: u8 = 0;
    let key = &KEY as *const u8 as AssocKey;
    c.bench_function("assoc_set_get_remove_1k", |b| {
        b.iter(|| {
            for object in objects.iter_mut() {
                let o = object as *mut u64 as RawObj;
                set_associated(&host, o, key, o, Policy::ASSIGN);
                assert!(!get_associated(&host, o, key).is_null());
                set_associated(&host, o, key, null_mut(), Policy::ASSIGN);
            }
        });
    });
}

fn bench_weak_churn(c: &mut Criterion) {
    let host = NullHost;
    let mut objects: Vec<u64> = (0..4096).collect();
    c.bench_function("weak_register_unregister_4k", |b| {
        b.iter_batched(|| (WeakTable::new(), vec![null_mut(); 4096]), |(mut table, mut slots)| {
            for (object, slot) in objects.iter_mut().zip(slots.iter_mut()) {
                let o = object as *mut u64 as RawObj;
                unsafe { table.register(&host, o, slot, false) };
            }
            for (object, slot) in objects.iter_mut().zip(slots.iter_mut()) {
                let o = object as *mut u64 as RawObj;
                table.unregister(&host, o, slot);
            }
        }, BatchSize::SmallInput);
    });
}

fn bench_weak_clear_many_aliases(c: &mut Criterion) {
    let host = NullHost;
    let mut object = 0u64;
    c.bench_function("weak_clear_64_aliases", |b| {
        b.iter_batched(|| (WeakTable::new(), vec![null_mut(); 64]), |(mut table, mut slots)| {
            let o = &mut object as *mut u64 as RawObj;
            for index in 0..slots.len() {
                unsafe { table.register(&host, o, &mut slots[index], false) };
                slots[index] = o;
            }
            unsafe { table.clear_on_dealloc(&host, o) };
        }, BatchSize::SmallInput);
    });
}

criterion_group!(side_tables, bench_assoc_churn, bench_weak_churn, bench_weak_clear_many_aliases);
criterion_main!(side_tables);
