//! Properties of the deterministic repacker.

mod common;

use common::make_upstream_archive;
use flate2::read::GzDecoder;
use pavlik::error::AppError;
use pavlik::repack::{repack, ArchiveFormat, ARCHIVE_MTIME_SECS};
use std::io::Cursor;

const UUID: &str = "11111111-1111-1111-1111-111111111111";
const REF: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567";

fn upstream() -> Vec<u8> {
    make_upstream_archive(
        "lib-0a1b2c3d",
        &[
            ("package.json", br#"{"name":"@acme/lib"}"#),
            ("src/index.js", b"module.exports = 1;\n"),
            ("README.md", b"# lib\n"),
        ],
        true,
    )
}

#[test]
fn repacking_twice_yields_identical_bytes_and_sha1() {
    for format in [ArchiveFormat::TarGz, ArchiveFormat::Zip] {
        let first = repack(&upstream(), UUID, REF, format).unwrap();
        let second = repack(&upstream(), UUID, REF, format).unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.sha1, second.sha1);
        assert_eq!(first.sha1, pavlik::sha1_hex(&first.bytes));
    }
}

#[test]
fn parallel_repacks_agree() {
    let handles: Vec<_> = (0..4)
        .map(|_| std::thread::spawn(|| repack(&upstream(), UUID, REF, ArchiveFormat::TarGz).unwrap()))
        .collect();
    let mut results = handles.into_iter().map(|h| h.join().unwrap());
    let first = results.next().unwrap();
    for other in results {
        assert_eq!(first.bytes, other.bytes);
        assert_eq!(first.sha1, other.sha1);
    }
}

#[test]
fn tarball_entries_are_canonically_named_and_timestamped() {
    let repacked = repack(&upstream(), UUID, REF, ArchiveFormat::TarGz).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(repacked.bytes.as_slice()));

    let canonical_top = format!("{UUID}-{REF}");
    let mut paths = Vec::new();
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().into_owned();
        assert!(
            path.starts_with(&canonical_top),
            "{} is outside the canonical directory",
            path.display()
        );
        assert_eq!(entry.header().mtime().unwrap(), ARCHIVE_MTIME_SECS);
        paths.push(path.to_string_lossy().into_owned());
    }

    assert!(paths.iter().all(|p| p != "pax_global_header"));
    assert!(paths.contains(&format!("{canonical_top}/package.json")));
    assert!(paths.contains(&format!("{canonical_top}/src/index.js")));
    // Sorted entry order, directories before their contents.
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}

#[test]
fn zip_entries_are_canonically_named_and_timestamped() {
    let repacked = repack(&upstream(), UUID, REF, ArchiveFormat::Zip).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(repacked.bytes)).unwrap();

    let canonical_top = format!("{UUID}-{REF}");
    let mut saw_manifest = false;
    for index in 0..archive.len() {
        let file = archive.by_index(index).unwrap();
        assert!(
            file.name().starts_with(&canonical_top),
            "{} is outside the canonical directory",
            file.name()
        );
        let stamp = file.last_modified().unwrap();
        assert_eq!(
            (
                stamp.year(),
                stamp.month(),
                stamp.day(),
                stamp.hour(),
                stamp.minute(),
                stamp.second()
            ),
            (2016, 10, 16, 23, 0, 0)
        );
        if file.name().ends_with("package.json") {
            saw_manifest = true;
        }
    }
    assert!(saw_manifest);
}

#[test]
fn upstream_file_modes_are_preserved() {
    // One executable file among regular ones.
    let mut builder = tar::Builder::new(Vec::new());
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o700);
    dir.set_mtime(1_700_000_000);
    builder
        .append_data(&mut dir, "tool-abc/", std::io::empty())
        .unwrap();

    let script: &[u8] = b"#!/bin/sh\nexit 0\n";
    let mut exec = tar::Header::new_gnu();
    exec.set_entry_type(tar::EntryType::Regular);
    exec.set_size(script.len() as u64);
    exec.set_mode(0o755);
    exec.set_mtime(1_700_000_000);
    builder
        .append_data(&mut exec, "tool-abc/run.sh", script)
        .unwrap();

    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
    let upstream = encoder.finish().unwrap();

    let repacked = repack(&upstream, UUID, REF, ArchiveFormat::TarGz).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(repacked.bytes.as_slice()));
    let mut modes = std::collections::HashMap::new();
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        modes.insert(path, entry.header().mode().unwrap() & 0o777);
    }

    assert_eq!(modes[&format!("{UUID}-{REF}/run.sh")], 0o755);
    // Directory entries are normalised to 0755 during extraction.
    assert_eq!(modes[&format!("{UUID}-{REF}/")], 0o755);
}

#[test]
fn archive_without_single_top_level_directory_is_rejected() {
    let mut builder = tar::Builder::new(Vec::new());
    for top in ["one", "two"] {
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_mtime(1_700_000_000);
        builder
            .append_data(&mut dir, format!("{top}/"), std::io::empty())
            .unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
    let upstream = encoder.finish().unwrap();

    let result = repack(&upstream, UUID, REF, ArchiveFormat::TarGz);
    assert!(matches!(
        result,
        Err(AppError::MalformedUpstreamArchive(_))
    ));
}

#[test]
fn garbage_input_is_rejected() {
    let result = repack(b"definitely not a tar.gz", UUID, REF, ArchiveFormat::TarGz);
    assert!(matches!(
        result,
        Err(AppError::MalformedUpstreamArchive(_))
    ));
}

#[test]
fn traversal_entries_are_rejected() {
    let mut builder = tar::Builder::new(Vec::new());
    let payload: &[u8] = b"owned";
    let mut evil = tar::Header::new_gnu();
    evil.set_entry_type(tar::EntryType::Regular);
    evil.set_size(payload.len() as u64);
    evil.set_mode(0o644);
    evil.set_mtime(1_700_000_000);
    let path = b"top/../../escape";
    evil.as_gnu_mut().unwrap().name[..path.len()].copy_from_slice(path);
    evil.set_cksum();
    builder.append(&evil, payload).unwrap();
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
    let upstream = encoder.finish().unwrap();

    let result = repack(&upstream, UUID, REF, ArchiveFormat::TarGz);
    assert!(matches!(
        result,
        Err(AppError::MalformedUpstreamArchive(_))
    ));
}

#[test]
fn different_refs_produce_different_canonical_names() {
    let other_ref = "ffffffffffffffffffffffffffffffffffffffff";
    let by_ref = repack(&upstream(), UUID, REF, ArchiveFormat::TarGz).unwrap();
    let by_other = repack(&upstream(), UUID, other_ref, ArchiveFormat::TarGz).unwrap();
    assert_ne!(by_ref.sha1, by_other.sha1);
}
