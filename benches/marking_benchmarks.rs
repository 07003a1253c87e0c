//! Microbenchmarks for the marking primitives.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use greymark::types::{Address, ObjectReference, WORD_SIZE};
use greymark::{AccessMode, MarkBitmap, MarkingWorklist};

const BASE: usize = 0x1000_0000;

fn object_at(word: usize) -> ObjectReference {
    ObjectReference::from_address(Address::from_usize(BASE + word * WORD_SIZE)).unwrap()
}

fn bench_bitmap_transitions(c: &mut Criterion) {
    let bitmap = MarkBitmap::new(Address::from_usize(BASE), 16 * 1024 * 1024);

    c.bench_function("bitmap_white_to_grey_atomic", |b| {
        let mut word = 0usize;
        b.iter(|| {
            word = (word + 2) % (1024 * 1024);
            black_box(bitmap.white_to_grey(object_at(word), AccessMode::Atomic))
        })
    });

    c.bench_function("bitmap_color_read_atomic", |b| {
        let object = object_at(128);
        bitmap.white_to_black(object, AccessMode::Atomic);
        b.iter(|| black_box(bitmap.color(object, AccessMode::Atomic)))
    });

    c.bench_function("bitmap_white_to_grey_non_atomic", |b| {
        let bitmap = MarkBitmap::new(Address::from_usize(BASE), 16 * 1024 * 1024);
        let mut word = 0usize;
        b.iter(|| {
            word = (word + 2) % (1024 * 1024);
            black_box(bitmap.white_to_grey(object_at(word), AccessMode::NonAtomic))
        })
    });
}

fn bench_worklist(c: &mut Criterion) {
    c.bench_function("worklist_push_pop", |b| {
        let worklist = MarkingWorklist::new(4096);
        let object = object_at(64);
        b.iter(|| {
            worklist.push(black_box(object));
            black_box(worklist.pop())
        })
    });

    c.bench_function("worklist_bailout_push_pop", |b| {
        let worklist = MarkingWorklist::new(4096);
        let object = object_at(64);
        b.iter(|| {
            worklist.push_bailout(black_box(object));
            black_box(worklist.pop())
        })
    });
}

criterion_group!(benches, bench_bitmap_transitions, bench_worklist);
criterion_main!(benches);
