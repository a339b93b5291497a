/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! End-to-end scenarios: multiple instances cooperating over one shared
//! directory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value};

use decsync::file::DecsyncFile;
use decsync::fs::memory::InMemoryFs;
use decsync::fs::posix::PosixFs;
use decsync::fs::{FileSystem, NativeFile};
use decsync::{get_static_info, list_collections, Decsync, Entry, Extra};

fn native(fs: &Arc<InMemoryFs>) -> NativeFile {
    NativeFile::root(Arc::clone(fs) as Arc<dyn FileSystem>)
}

fn root(fs: &Arc<InMemoryFs>) -> DecsyncFile {
    DecsyncFile::new(native(fs))
}

fn segs(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| (*s).to_owned()).collect()
}

fn instance<T>(fs: &Arc<InMemoryFs>, app_id: &str) -> Decsync<T> {
    let local = native(fs).child("locals").child(app_id);
    Decsync::new(native(fs), local, "sync", None, app_id).unwrap()
}

type ExtraMap = RefCell<HashMap<(Vec<String>, String), Value>>;

#[test]
fn test_basic_set_and_execute() {
    let fs = Arc::new(InMemoryFs::new());
    let writer: Decsync<()> = instance(&fs, "A");
    let path = segs(&["path", "unicode ☺"]);
    writer.set_entry(&path, json!("k"), json!("v")).unwrap();

    let mut reader: Decsync<ExtraMap> = instance(&fs, "B");
    reader.add_listener(&[], |path, entry, extra| {
        if let Extra::WithExtra(map) = extra {
            map.borrow_mut()
                .insert((path.to_vec(), entry.key.to_string()), entry.value.clone());
        }
        true
    });

    let extra: ExtraMap = RefCell::new(HashMap::new());
    reader.execute_all_new_entries(&extra, true);
    assert_eq!(1, extra.borrow().len());
    assert_eq!(
        Some(&json!("v")),
        extra.borrow().get(&(path.clone(), "\"k\"".to_owned()))
    );

    // A second pass delivers nothing new.
    reader.execute_all_new_entries(&extra, true);
    assert_eq!(1, extra.borrow().len());
}

#[test]
fn test_conflicting_writes_converge_on_later_datetime() {
    let fs = Arc::new(InMemoryFs::new());
    let path = segs(&["path"]);
    let first: Decsync<()> = instance(&fs, "A");
    let second: Decsync<()> = instance(&fs, "B");
    first
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-08-23T00:00:00", json!("k"), json!("a-val"))],
        )
        .unwrap();
    second
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-08-23T00:00:01", json!("k"), json!("b-val"))],
        )
        .unwrap();

    let mut first: Decsync<()> = instance(&fs, "A");
    let mut second: Decsync<()> = instance(&fs, "B");
    first.execute_all_new_entries(&(), true);
    second.execute_all_new_entries(&(), true);

    for app in ["A", "B"] {
        let stored = root(&fs)
            .child("sync")
            .child("stored-entries")
            .child(app)
            .child("path")
            .read_lines(0)
            .unwrap();
        assert_eq!(
            vec![r#"["2020-08-23T00:00:01","k","b-val"]"#.to_owned()],
            stored,
            "app {} did not converge",
            app
        );
    }
}

#[test]
fn test_equal_datetimes_converge_on_larger_value() {
    let fs = Arc::new(InMemoryFs::new());
    let path = segs(&["path"]);
    let first: Decsync<()> = instance(&fs, "A");
    let second: Decsync<()> = instance(&fs, "B");
    first
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-08-23T00:00:00", json!("k"), json!("za"))],
        )
        .unwrap();
    second
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-08-23T00:00:00", json!("k"), json!("zb"))],
        )
        .unwrap();

    let mut first: Decsync<()> = instance(&fs, "A");
    let mut second: Decsync<()> = instance(&fs, "B");
    first.execute_all_new_entries(&(), true);
    second.execute_all_new_entries(&(), true);

    for app in ["A", "B"] {
        let stored = root(&fs)
            .child("sync")
            .child("stored-entries")
            .child(app)
            .child("path")
            .read_lines(0)
            .unwrap();
        assert_eq!(vec![r#"["2020-08-23T00:00:00","k","zb"]"#.to_owned()], stored);
    }
}

#[test]
fn test_list_collections_discovery() {
    let fs = Arc::new(InMemoryFs::new());
    assert!(list_collections(&native(&fs), "contacts").is_empty());

    for name in ["foo", "bar"] {
        let local = native(&fs).child("locals").child(name);
        let decsync: Decsync<()> =
            Decsync::new(native(&fs), local, "contacts", Some(name), "app").unwrap();
        decsync
            .set_entry(&segs(&["info"]), json!("name"), json!(name))
            .unwrap();
    }

    let mut collections = list_collections(&native(&fs), "contacts");
    collections.sort();
    assert_eq!(vec!["bar".to_owned(), "foo".to_owned()], collections);
}

#[test]
fn test_static_info_merges_apps() {
    let fs = Arc::new(InMemoryFs::new());
    let first: Decsync<()> = instance(&fs, "A");
    let second: Decsync<()> = instance(&fs, "B");
    first
        .set_entry(&segs(&["info"]), json!("name"), json!("foo"))
        .unwrap();
    second
        .set_entry(&segs(&["info"]), json!("color"), json!("bar"))
        .unwrap();

    let static_info = get_static_info(&native(&fs), "sync", None).unwrap();
    assert_eq!(2, static_info.len());
    assert_eq!(Some(&json!("foo")), static_info.get("\"name\""));
    assert_eq!(Some(&json!("bar")), static_info.get("\"color\""));
}

#[test]
fn test_upgrade_path_retains_values_for_fresh_install() {
    let fs = Arc::new(InMemoryFs::new());
    let legacy: Decsync<()> = instance(&fs, "A");
    legacy
        .set_entries_for_path(
            &segs(&["p"]),
            vec![Entry::with_datetime("2020-01-01T00:00:00", json!("k"), json!("v1"))],
        )
        .unwrap();

    root(&fs)
        .hidden_child("decsync-info")
        .write_text(r#"{"version":2}"#)
        .unwrap();

    // A fresh install materializes the legacy data and carries out the
    // pending upgrade.
    let seen = Rc::new(RefCell::new(vec![]));
    let mut fresh: Decsync<()> = instance(&fs, "B");
    let sink = Rc::clone(&seen);
    fresh.add_listener(&[], move |path, entry, extra| {
        let live = matches!(extra, Extra::WithExtra(_));
        sink.borrow_mut()
            .push((path.to_vec(), entry.value.clone(), live));
        true
    });
    fresh.init_stored_entries();
    assert_eq!(vec![(segs(&["p"]), json!("v1"), false)], *seen.borrow());

    fresh.execute_stored_entry(&segs(&["p"]), json!("k"), &());
    assert_eq!(2, seen.borrow().len());
    assert_eq!((segs(&["p"]), json!("v1"), true), seen.borrow()[1]);

    // A later write from the legacy layout is invisible to the upgraded
    // instance but still reaches the merged static info.
    legacy
        .set_entries_for_path(
            &segs(&["p"]),
            vec![Entry::with_datetime("2020-03-01T00:00:00", json!("k"), json!("v3"))],
        )
        .unwrap();
    legacy
        .set_entries_for_path(
            &segs(&["info"]),
            vec![Entry::with_datetime(
                "2020-03-01T00:00:00",
                json!("name"),
                json!("legacy"),
            )],
        )
        .unwrap();
    fresh.execute_all_new_entries(&(), true);
    assert_eq!(2, seen.borrow().len());

    let static_info = get_static_info(&native(&fs), "sync", None).unwrap();
    assert_eq!(Some(&json!("legacy")), static_info.get("\"name\""));
}

#[test]
fn test_sequence_skip_avoids_opening_unchanged_files() {
    let fs = Arc::new(InMemoryFs::new());
    let writer: Decsync<()> = instance(&fs, "A");
    writer
        .set_entries_for_path(
            &segs(&["dir", "file"]),
            vec![Entry::with_datetime("2020-01-01T00:00:00", json!("k"), json!("v"))],
        )
        .unwrap();

    let seen = Rc::new(RefCell::new(vec![]));
    let mut reader: Decsync<()> = instance(&fs, "B");
    let sink = Rc::clone(&seen);
    reader.add_listener(&[], move |_, entry, _| {
        sink.borrow_mut().push(entry.value.clone());
        true
    });
    reader.execute_all_new_entries(&(), true);
    assert_eq!(vec![json!("v")], *seen.borrow());

    let log = &["sync", "new-entries", "A", "dir", "file"];
    let opened = fs.read_count(log);
    assert!(opened > 0);

    // A file modified without a sequence bump stays invisible.
    root(&fs)
        .child("sync")
        .child("new-entries")
        .child("A")
        .child("dir")
        .child("file")
        .write_lines(
            &[r#"["2020-02-01T00:00:00","k2","v2"]"#.to_owned()],
            true,
        )
        .unwrap();
    reader.execute_all_new_entries(&(), true);
    assert_eq!(opened, fs.read_count(log));
    assert_eq!(1, seen.borrow().len());

    // Bumping the sequences makes the next pass pick it up.
    for dir in [
        root(&fs).child("sync").child("new-entries").child("A"),
        root(&fs)
            .child("sync")
            .child("new-entries")
            .child("A")
            .child("dir"),
    ] {
        let file = dir.hidden_child("decsync-sequence");
        let next = file.read_text().unwrap().unwrap().parse::<u64>().unwrap() + 1;
        file.write_text(&next.to_string()).unwrap();
    }
    reader.execute_all_new_entries(&(), true);
    assert!(fs.read_count(log) > opened);
    assert_eq!(vec![json!("v"), json!("v2")], *seen.borrow());
}

#[test]
fn test_cursor_never_decreases() {
    let fs = Arc::new(InMemoryFs::new());
    let writer: Decsync<()> = instance(&fs, "A");
    let mut reader: Decsync<()> = instance(&fs, "B");
    let cursor_file = root(&fs)
        .child("sync")
        .child("read-bytes")
        .child("B")
        .child("A")
        .child("path");

    let mut last = 0;
    for round in 0..3 {
        writer
            .set_entries_for_path(
                &segs(&["path"]),
                vec![Entry::with_datetime(
                    &format!("2020-01-0{}T00:00:00", round + 1),
                    json!("k"),
                    json!(round),
                )],
            )
            .unwrap();
        reader.execute_all_new_entries(&(), true);
        let cursor = cursor_file
            .read_text()
            .unwrap()
            .map_or(0, |text| text.parse::<u64>().unwrap());
        assert!(cursor >= last, "cursor moved backwards");
        last = cursor;
    }
    assert!(last > 0);
}

#[test]
fn test_no_empty_files_at_rest_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = Arc::new(PosixFs::new(tmp.path()));
    let make = |app: &str| -> Decsync<()> {
        let root = NativeFile::root(Arc::clone(&fs) as Arc<dyn FileSystem>);
        let local = root.child("locals").child(app);
        Decsync::new(root, local, "sync", None, app).unwrap()
    };

    let writer = make("A");
    let path = segs(&["dir", "item"]);
    writer
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-01-01T00:00:00", json!("k"), json!("v1"))],
        )
        .unwrap();
    // Overwrite forces a snapshot rewrite.
    writer
        .set_entries_for_path(
            &path,
            vec![Entry::with_datetime("2020-01-02T00:00:00", json!("k"), json!("v2"))],
        )
        .unwrap();

    let mut reader = make("B");
    reader.execute_all_new_entries(&(), false);
    reader.execute_all_new_entries(&(), false);

    for entry in walkdir::WalkDir::new(tmp.path()) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let length = entry.metadata().unwrap().len();
            assert!(
                length > 0,
                "zero-length file at rest: {}",
                entry.path().display()
            );
        }
    }
}
