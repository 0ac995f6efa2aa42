//! Integration tests: one writer and its readers sharing a file.
//!
//! These tests go through the public API only, the way two processes would
//! see each other: a `Writer` mutating and growing values while `Reader`
//! views keep resolving them.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::mem::offset_of;
use std::path::PathBuf;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use proptest::prelude::*;
use tempfile::TempDir;

use growfile_core::format::CELL_LENGTH;
use growfile_core::{
    create_unique, publish, ArrayHandle, Config, Field, GrowError, Handle, LiveArray, Reader,
    Series, SignalRegistry, Storable, TextRef, TypeDesc, Writer,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn small_config() -> Config {
    let mut config = Config::embedded();
    config.initial_file_size = 8192;
    config.min_extend_bytes = 4096;
    config.directory_initial_bytes = 256;
    config
}

fn test_file() -> (PathBuf, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.gf");
    (path, dir)
}

fn sum_from_to(lo: i64, hi: i64) -> i64 {
    (lo..=hi).sum()
}

fn fill_sequence(writer: &mut Writer, handle: &ArrayHandle<i32>, from: usize, to: usize) {
    let data = writer.slice_mut(handle).unwrap();
    for (i, slot) in data.iter_mut().enumerate().take(to).skip(from) {
        *slot = i as i32;
    }
    writer.set_length(handle, to as u64).unwrap();
}

fn sum(values: &[i32]) -> i64 {
    values.iter().map(|&v| v as i64).sum()
}

// ---------------------------------------------------------------------------
// Unique names and publishing
// ---------------------------------------------------------------------------

#[test]
fn test_unique_filenames_and_publish() {
    let dir = TempDir::new().unwrap();
    let first = create_unique(dir.path(), ".log.staging").unwrap();
    let second = create_unique(dir.path(), ".log.staging").unwrap();
    assert_ne!(first, second);
    assert!(first.exists() && second.exists());

    let mut writer = Writer::open(&second, small_config()).unwrap();
    let x = writer.define::<i64>("x").unwrap();
    writer.set(&x, 42).unwrap();
    writer.close().unwrap();

    let published = publish(&second, dir.path(), ".log").unwrap();
    assert!(!second.exists());
    assert!(published.exists());
    assert!(published.to_string_lossy().ends_with(".log"));

    let reader = Reader::open(&published).unwrap();
    assert_eq!(reader.lookup::<i64>("x").unwrap().get().unwrap(), 42);
}

// ---------------------------------------------------------------------------
// Create / Modify
// ---------------------------------------------------------------------------

#[test]
fn test_create_and_fill() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();

    let n = 1020;
    let vs = writer.define_array::<i32>("vs", n as u64).unwrap();
    assert_eq!(writer.len(&vs).unwrap(), 0);
    assert_eq!(writer.capacity(&vs).unwrap(), n as u64);

    fill_sequence(&mut writer, &vs, 0, n);
    assert_eq!(sum(writer.slice(&vs).unwrap()), sum_from_to(0, 1019));
}

#[test]
fn test_second_writer_continues_first() {
    let (path, _dir) = test_file();
    let n = 1020;

    let mut first = Writer::open(&path, small_config()).unwrap();
    let vs = first.define_array::<i32>("vs", n as u64).unwrap();
    fill_sequence(&mut first, &vs, 0, n / 2);
    assert_eq!(sum(first.slice(&vs).unwrap()), sum_from_to(0, 509));
    first.close().unwrap();

    let mut second = Writer::open(&path, small_config()).unwrap();
    let vs = second.lookup_array::<i32>("vs").unwrap();
    assert_eq!(sum(second.slice(&vs).unwrap()), sum_from_to(0, 509));
    fill_sequence(&mut second, &vs, n / 2, n);

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();
    assert_eq!(live.len().unwrap(), n as u64);
    assert_eq!(sum(&live.to_vec().unwrap()), sum_from_to(0, 1019));
}

#[test]
fn test_open_writer_catches_up_with_extended_file() {
    let (path, _dir) = test_file();
    let mut first = Writer::open(&path, small_config()).unwrap();
    let vs = first.define_array::<i32>("vs", 4).unwrap();
    first.push(&vs, 7).unwrap();

    // Another writer pushes the file far past the first one's mapping.
    let mut second = Writer::open(&path, small_config()).unwrap();
    let theirs = second.lookup_array::<i32>("vs").unwrap();
    for v in 1..6020 {
        second.push(&theirs, v).unwrap();
    }
    drop(second);

    assert_eq!(first.len(&vs).unwrap(), 6020);
    let values = first.slice(&vs).unwrap();
    assert_eq!(values[0], 7);
    assert_eq!(values[6019], 6019);
    assert_eq!(sum(values), 7 + sum_from_to(1, 6019));

    // Allocation resumes from the extended end.
    let extra = first.define_array::<i64>("extra", 2).unwrap();
    first.push(&extra, -1).unwrap();
    assert_eq!(first.push(&vs, 6020).unwrap(), 6021);

    let reader = Reader::open(&path).unwrap();
    assert_eq!(reader.lookup_array::<i32>("vs").unwrap().len().unwrap(), 6021);
    assert_eq!(reader.lookup_array::<i64>("extra").unwrap().to_vec().unwrap(), vec![-1]);
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

#[test]
fn test_values_are_naturally_aligned() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();

    let s = writer.define::<i16>("s").unwrap();
    let i = writer.define::<i32>("i").unwrap();
    let d = writer.define::<f64>("d").unwrap();
    let a = writer.define_array::<i32>("a", 100).unwrap();
    let r = writer.define_ref::<i32>("r").unwrap();
    writer.store(&r, 7).unwrap();

    assert_eq!(writer.address(&s) % 2, 0);
    assert_eq!(writer.address(&i) % 4, 0);
    assert_eq!(writer.address(&d) % 8, 0);
    assert_eq!(writer.address(&a) % 8, 0);
    assert_eq!(writer.address(&r) % 8, 0);

    let data = writer.slice_mut(&a).unwrap();
    assert_eq!(data.as_ptr() as usize % 8, 0);
}

// ---------------------------------------------------------------------------
// Growth under a live reader
// ---------------------------------------------------------------------------

#[test]
fn test_grow_away_from_reader() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let vs = writer.define_array::<i32>("vs", 1).unwrap();
    writer.push(&vs, 1).unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();
    assert_eq!(live.len().unwrap(), 1);
    assert_eq!(sum(&live.to_vec().unwrap()), 1);

    // Far past the reader's mapping; the new block tail is zero-filled.
    let nlen = 10_000u64;
    assert!(writer.grow(&vs, nlen).unwrap());
    assert_eq!(live.get(0).unwrap(), Some(1));
    let data = writer.slice_mut(&vs).unwrap();
    data[0] = 0;
    data[(nlen - 1) as usize] = 8_675_309;
    writer.set_length(&vs, nlen).unwrap();

    assert_eq!(live.len().unwrap(), nlen);
    assert_eq!(live.capacity().unwrap(), nlen);
    assert_eq!(sum(&live.to_vec().unwrap()), 8_675_309);
    assert_eq!(live.get(nlen - 1).unwrap(), Some(8_675_309));
    assert_eq!(live.get(nlen).unwrap(), None);

    let stats = reader.stats().unwrap();
    assert!(stats.orphaned_bytes > 0);
}

#[test]
fn test_length_past_capacity_reported_as_corruption() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let vs = writer.define_array::<i32>("vs", 4).unwrap();
    writer.push(&vs, 1).unwrap();
    writer.close().unwrap();

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(vs.offset().as_u64() + CELL_LENGTH)).unwrap();
    file.write_all(&5u64.to_le_bytes()).unwrap();
    file.sync_all().unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();
    assert!(matches!(live.len(), Err(GrowError::Corruption { .. })));
    assert!(matches!(live.to_vec(), Err(GrowError::Corruption { .. })));
    assert!(matches!(live.get(0), Err(GrowError::Corruption { .. })));
}

#[test]
fn test_reader_sees_capacity_before_any_data() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    writer.define_array::<i32>("vs", 100).unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();
    assert_eq!(live.capacity().unwrap(), 100);
    assert!(live.is_empty().unwrap());
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[test]
fn test_signals_follow_pushes() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let vs = writer.define_array::<i32>("vs", 1000).unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();

    let lensum = Rc::new(RefCell::new((0u64, 0i64)));
    let seen = Rc::clone(&lensum);
    let mut registry = SignalRegistry::new();
    registry
        .watch(&live, move |view: &LiveArray<i32>| {
            *seen.borrow_mut() = (view.len().unwrap(), sum(&view.to_vec().unwrap()));
        })
        .unwrap();

    let expected = [(1, 0), (2, 1), (3, 3), (4, 6)];
    for (v, want) in expected.iter().enumerate() {
        writer.push(&vs, v as i32).unwrap();
        writer.mark_value_dirty(&vs).unwrap();
        assert!(registry.poll().unwrap());
        assert_eq!(*lensum.borrow(), *want);
    }
    assert!(!registry.poll().unwrap());
}

#[test]
fn test_signals_follow_series_appends() {
    let (path, _dir) = test_file();
    let mut config = small_config();
    config.series_initial_capacity = 2;
    let mut writer = Writer::open(&path, config).unwrap();
    let series = Series::<i32>::open(&mut writer, "vs").unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<i32>("vs").unwrap();

    let lensum = Rc::new(RefCell::new((0u64, 0i64)));
    let seen = Rc::clone(&lensum);
    let mut registry = SignalRegistry::new();
    registry
        .watch(&live, move |view: &LiveArray<i32>| {
            *seen.borrow_mut() = (view.len().unwrap(), sum(&view.to_vec().unwrap()));
        })
        .unwrap();

    // No explicit marking: each append bumps the series generation itself.
    let expected = [(1, 0), (2, 1), (3, 3), (4, 6)];
    for (v, want) in (0..).zip(expected) {
        series.append(&mut writer, &v).unwrap();
        assert!(registry.poll().unwrap());
        assert_eq!(*lensum.borrow(), want);
    }
    assert!(!registry.poll().unwrap());
}

#[test]
fn test_scalar_signal_after_file_dirty() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let x = writer.define::<i32>("x").unwrap();

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup::<i32>("x").unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&fired);
    let mut registry = SignalRegistry::new();
    registry.watch(&live, move |v| log.borrow_mut().push(v.get().unwrap())).unwrap();

    writer.set(&x, 42).unwrap();
    writer.mark_dirty().unwrap();
    assert!(registry.poll().unwrap());
    assert_eq!(*fired.borrow(), vec![42]);

    drop(reader);
    assert!(!registry.poll().unwrap());
    assert!(registry.is_empty());
}

// ---------------------------------------------------------------------------
// Series and records
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SeriesTest {
    x: i32,
    _pad: u32,
    y: f64,
    z: TextRef,
}

impl Storable for SeriesTest {
    fn type_desc() -> TypeDesc {
        TypeDesc::record::<SeriesTest>(vec![
            Field::new("x", offset_of!(SeriesTest, x), i32::type_desc()),
            Field::new("y", offset_of!(SeriesTest, y), f64::type_desc()),
            Field::new("z", offset_of!(SeriesTest, z), TextRef::type_desc()),
        ])
    }
}

#[test]
fn test_series_records_with_text() {
    let (path, _dir) = test_file();
    let mut config = small_config();
    config.series_initial_capacity = 4;
    let mut writer = Writer::open(&path, config).unwrap();
    let series = Series::<SeriesTest>::open(&mut writer, "series_test").unwrap();

    for i in 0..10 {
        let z = writer.store_text(&format!("string_{}", i)).unwrap();
        let record = SeriesTest { x: i, _pad: 0, y: 3.14159 * i as f64, z };
        series.append(&mut writer, &record).unwrap();
    }
    assert_eq!(series.len(&mut writer).unwrap(), 10);

    let reader = Reader::open(&path).unwrap();
    let live = reader.lookup_array::<SeriesTest>("series_test").unwrap();
    let records = live.to_vec().unwrap();
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.x, i as i32);
        assert!((record.y - 3.14159 * i as f64).abs() < 1e-9);
        assert_eq!(live.read_text(record.z).unwrap(), format!("string_{}", i));
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Pair {
    first: i32,
    _pad: u32,
    second: f64,
}

impl Storable for Pair {
    fn type_desc() -> TypeDesc {
        TypeDesc::record::<Pair>(vec![
            Field::new("first", offset_of!(Pair, first), i32::type_desc()),
            Field::new("second", offset_of!(Pair, second), f64::type_desc()),
        ])
    }
}

#[test]
fn test_array_of_pairs() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let xs = writer.define_array::<Pair>("xs", 100).unwrap();
    for (i, pair) in writer.slice_mut(&xs).unwrap().iter_mut().enumerate() {
        pair.first = i as i32 + 1;
        pair.second = i as f64;
    }
    writer.set_length(&xs, 100).unwrap();

    let reader = Reader::open(&path).unwrap();
    let pairs = reader.lookup_array::<Pair>("xs").unwrap().to_vec().unwrap();
    assert_eq!(pairs.iter().map(|p| p.first).sum::<i32>(), 5050);
}

#[test]
fn test_lookup_with_wrong_type() {
    let (path, _dir) = test_file();
    let mut writer = Writer::open(&path, small_config()).unwrap();
    let xs = writer.define_array::<Pair>("xs", 4).unwrap();

    let reader = Reader::open(&path).unwrap();
    assert_eq!(reader.lookup_array::<Pair>("xs").unwrap().handle(), xs);
    assert!(matches!(
        reader.lookup_array::<i32>("xs"),
        Err(GrowError::TypeMismatch { .. })
    ));
    assert!(matches!(reader.lookup::<Pair>("xs"), Err(GrowError::TypeMismatch { .. })));
    assert!(matches!(
        writer.lookup_array::<f64>("xs"),
        Err(GrowError::TypeMismatch { .. })
    ));
}

// ---------------------------------------------------------------------------
// Growth property
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_grow_preserves_elements(
        initial in proptest::collection::vec(any::<i64>(), 0..64),
        steps in proptest::collection::vec(0u64..512, 1..8),
    ) {
        let (path, _dir) = test_file();
        let mut writer = Writer::open(&path, small_config()).unwrap();
        let xs = writer.define_array::<i64>("xs", initial.len() as u64).unwrap();
        writer.slice_mut(&xs).unwrap().copy_from_slice(&initial);
        writer.set_length(&xs, initial.len() as u64).unwrap();

        let reader = Reader::open(&path).unwrap();
        let live = reader.lookup_array::<i64>("xs").unwrap();

        let mut capacity = initial.len() as u64;
        for step in steps {
            capacity += step;
            writer.grow(&xs, capacity).unwrap();
            prop_assert_eq!(writer.capacity(&xs).unwrap(), capacity);
            prop_assert_eq!(writer.slice(&xs).unwrap(), &initial[..]);
            prop_assert_eq!(live.to_vec().unwrap(), initial.clone());
        }
    }
}
