use std::fs;

use zipkit::{Archive, ZipError};

#[test]
fn write_finalize_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.zip");

    let mut archive = Archive::open(&path);
    assert!(archive.is_empty());
    archive.add("hello.txt", "Hello, world!").unwrap();
    archive.add("bin/data", [0u8, 1, 2, 3, 255]).unwrap();
    archive.finalize().unwrap();

    let archive = Archive::open(&path);
    assert_eq!(archive.len(), 2);

    let names: Vec<_> = archive.items().map(|e| e.name().to_string()).collect();
    assert_eq!(names, ["hello.txt", "bin/data"]);

    let hello = archive.lookup("hello.txt").unwrap();
    assert_eq!(hello.size(), 13);
    assert_eq!(hello.text().unwrap(), "Hello, world!");
    assert!(!hello.is_dir());

    let data = archive.lookup("bin/data").unwrap();
    assert_eq!(data.content().unwrap(), [0, 1, 2, 3, 255]);

    assert!(archive.lookup("missing.txt").is_none());
}

#[test]
fn drop_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.zip");
    {
        let mut archive = Archive::open(&path);
        archive.add("kept.txt", "still here").unwrap();
        // No explicit finalize; Drop must write the central directory.
    }
    let archive = Archive::open(&path);
    assert_eq!(
        archive.lookup("kept.txt").unwrap().text().unwrap(),
        "still here"
    );
}

#[test]
fn append_to_existing_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grown.zip");

    {
        let mut archive = Archive::open(&path);
        archive.add("gen1.txt", "first generation").unwrap();
    }
    let first_len = fs::metadata(&path).unwrap().len();

    {
        let mut archive = Archive::open(&path);
        assert_eq!(archive.len(), 1);
        archive.add("gen2.txt", "second generation").unwrap();
    }
    // The original entry's bytes stay physically in place.
    assert!(fs::metadata(&path).unwrap().len() > first_len);

    let archive = Archive::open(&path);
    assert_eq!(archive.len(), 2);
    assert_eq!(
        archive.lookup("gen1.txt").unwrap().text().unwrap(),
        "first generation"
    );
    assert_eq!(
        archive.lookup("gen2.txt").unwrap().text().unwrap(),
        "second generation"
    );
}

#[test]
fn stored_and_deflated_levels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("levels.zip");
    let body = "abcdefgh".repeat(4096);

    {
        let mut archive = Archive::open(&path);
        archive.set_level(0);
        archive.add("stored.txt", &body).unwrap();
        archive.set_level(9);
        archive.add("squeezed.txt", &body).unwrap();
    }

    let archive = Archive::open(&path);
    let stored = archive.lookup("stored.txt").unwrap();
    assert_eq!(stored.compressed_size(), stored.size());
    let squeezed = archive.lookup("squeezed.txt").unwrap();
    assert!(squeezed.compressed_size() < squeezed.size());
    assert_eq!(squeezed.text().unwrap(), body);
    assert_eq!(stored.text().unwrap(), body);
}

#[test]
fn duplicate_names_keep_both_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dups.zip");
    {
        let mut archive = Archive::open(&path);
        archive.add("config.ini", "v1").unwrap();
        archive.add("config.ini", "v2").unwrap();
    }
    let archive = Archive::open(&path);
    // Both records are listed; lookup resolves to the newest.
    assert_eq!(archive.items().count(), 2);
    assert_eq!(archive.lookup("config.ini").unwrap().text().unwrap(), "v2");
}

#[test]
fn add_after_finalize_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = Archive::open(dir.path().join("closed.zip"));
    archive.add("a.txt", "a").unwrap();
    archive.finalize().unwrap();
    assert!(matches!(
        archive.add("b.txt", "b"),
        Err(ZipError::ArchiveClosed)
    ));
    // Reads are refused once the handle is gone, too.
    assert!(archive.lookup("a.txt").unwrap().content().is_err());
}

#[test]
fn damaged_central_record_keeps_earlier_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("damaged.zip");
    {
        let mut archive = Archive::open(&path);
        // Stored bodies keep the payload bytes literal, so the only
        // central-directory signatures in the file are the real ones.
        archive.set_level(0);
        archive.add("first.txt", "still readable").unwrap();
        archive.add("second.txt", "about to vanish").unwrap();
        archive.add("third.txt", "behind the damage").unwrap();
    }

    // Flip the magic of the second central-directory record.
    let mut bytes = fs::read(&path).unwrap();
    let central_sig = [0x50, 0x4b, 0x01, 0x02];
    let second = bytes
        .windows(central_sig.len())
        .enumerate()
        .filter(|(_, w)| *w == central_sig)
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    bytes[second] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    // Enumeration stops at the damage but keeps what came before it.
    let archive = Archive::open(&path);
    assert_eq!(archive.len(), 1);
    assert_eq!(
        archive.lookup("first.txt").unwrap().text().unwrap(),
        "still readable"
    );
    assert!(archive.lookup("second.txt").is_none());
    assert!(archive.lookup("third.txt").is_none());
}

#[test]
fn add_file_uses_source_name_and_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("report.csv");
    fs::write(&src, "a,b\n1,2\n").unwrap();
    let path = dir.path().join("files.zip");

    {
        let mut archive = Archive::open(&path);
        // Prefix ending in '/' takes the source file's own name.
        archive.add_file("exports/", &src).unwrap();
        archive.add_file("renamed.csv", &src).unwrap();
    }

    let archive = Archive::open(&path);
    let entry = archive.lookup("exports/report.csv").unwrap();
    assert_eq!(entry.text().unwrap(), "a,b\n1,2\n");
    // MS-DOS timestamps keep 2-second precision, so just require a
    // believable year rather than an exact match.
    assert!(entry.last_modified().year() >= 2020);
    assert!(archive.lookup("renamed.csv").is_some());
}
