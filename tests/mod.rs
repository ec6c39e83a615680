// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod test {
    use std::io::Write;

    use byteorder::{LittleEndian, WriteBytesExt};
    use camino::Utf8Path;

    use depot_ingest::bundle::{BlockDecompressor, FileRecord};
    use depot_ingest::digest::Sha256Digest;
    use depot_ingest::error::IngestError;
    use depot_ingest::extent_map::ExtentMap;
    use depot_ingest::ggpk;
    use depot_ingest::ingest::bundled::ingest_bundled;
    use depot_ingest::ingest::loose::ingest_loose;
    use depot_ingest::pathhash::{ModernHasher, PathHasher};
    use depot_ingest::progress::NoProgress;
    use depot_ingest::source::{DiskSource, Source, ZipSource};
    use depot_ingest::store::fs::FilesystemStore;
    use depot_ingest::store::{ArtifactStore, DepotFact, IndexKind, IndexRecord};

    struct IdentityDecompressor;
    impl BlockDecompressor for IdentityDecompressor {
        fn decompress_block(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, IngestError> {
            assert_eq!(compressed.len(), uncompressed_size);
            Ok(compressed.to_vec())
        }
    }

    fn build_outer_bundle(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
        buf.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.extend([0u8; 16]);
        buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    fn path_stream(entries: &[&str]) -> Vec<u8> {
        let mut stream = Vec::new();
        stream.write_u32::<LittleEndian>(0).unwrap();
        for (i, e) in entries.iter().enumerate() {
            stream.write_u32::<LittleEndian>((i + 1) as u32).unwrap();
            stream.extend_from_slice(e.as_bytes());
            stream.push(0);
        }
        stream.write_u32::<LittleEndian>(0).unwrap();
        for i in 0..entries.len() {
            stream.write_u32::<LittleEndian>((i + 1) as u32).unwrap();
            stream.push(0);
        }
        stream
    }

    fn build_index_bundle(bundles: &[(&str, u32)], files: &[FileRecord], path_reps_payload: &[u8], rep_hash: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(bundles.len() as u32).unwrap();
        for (name, usize_) in bundles {
            payload.write_u32::<LittleEndian>(name.len() as u32).unwrap();
            payload.extend_from_slice(name.as_bytes());
            payload.write_u32::<LittleEndian>(*usize_).unwrap();
        }
        payload.write_u32::<LittleEndian>(files.len() as u32).unwrap();
        for f in files {
            payload.write_u64::<LittleEndian>(f.path_hash).unwrap();
            payload.write_u32::<LittleEndian>(f.bundle_index).unwrap();
            payload.write_u32::<LittleEndian>(f.file_offset).unwrap();
            payload.write_u32::<LittleEndian>(f.file_size).unwrap();
        }
        payload.write_u32::<LittleEndian>(1).unwrap();
        payload.write_u64::<LittleEndian>(rep_hash).unwrap();
        payload.write_u32::<LittleEndian>(0).unwrap();
        payload.write_u32::<LittleEndian>(path_reps_payload.len() as u32).unwrap();
        payload.write_u32::<LittleEndian>(path_reps_payload.len() as u32).unwrap();
        payload.extend_from_slice(&build_outer_bundle(path_reps_payload));
        build_outer_bundle(&payload)
    }

    fn write_file(root: &Utf8Path, name: &str, contents: &[u8]) {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    /// Scenario 1: a single-file ZIP source produces one loose-index row
    /// and one stored object, addressed by the content's SHA-256.
    #[tokio::test(flavor = "multi_thread")]
    async fn zip_source_single_file_ingest() {
        let zip_dir = camino_tempfile::tempdir().unwrap();
        let zip_path = zip_dir.path().join("depot.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("a.txt", zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap();
        }

        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(store_dir.path().to_path_buf());
        let em = ExtentMap::open_temporary().unwrap();
        let source = ZipSource::new(zip_path);
        let progress = NoProgress::new();

        ingest_loose(&store, &em, &source, 1, 1001, None, &progress)
            .await
            .unwrap();

        let rows: Vec<IndexRecord> = store
            .index_reader(1, 1001, IndexKind::Loose)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "a.txt");
        assert_eq!(
            rows[0].sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let expected_phash = ModernHasher::default().hash_file("a.txt");
        assert_eq!(rows[0].phash, expected_phash.to_string());
        assert_eq!(rows[0].size, 5);

        let digest = Sha256Digest::from_hex(&rows[0].sha256).unwrap();
        assert_eq!(store.read_data(&digest).unwrap(), Some(b"hello".to_vec()));
    }

    /// End-to-end pipeline: loose ingest over a disk tree that contains a
    /// bundle container, followed by bundled ingest, recovers the inner
    /// file and populates the extent map -- scenario 4 driven through the
    /// full two-phase engine rather than unit-testing C8 alone.
    #[tokio::test(flavor = "multi_thread")]
    async fn full_pipeline_loose_then_bundled_recovers_inner_file() {
        let hasher = ModernHasher::default();
        let art_hash = hasher.hash_dir("Art");
        let path_hash = hasher.hash_file("Art/foo.dat");
        let path_payload = path_stream(&["Art/foo.dat"]);

        let bundle_payload = b"ABCDEFGHIJ".to_vec();
        let bundle_raw = build_outer_bundle(&bundle_payload);

        let file_record = FileRecord {
            path_hash,
            bundle_index: 0,
            file_offset: 3,
            file_size: 4,
        };
        let index_raw = build_index_bundle(&[("X", 10)], &[file_record], &path_payload, art_hash);

        let src_dir = camino_tempfile::tempdir().unwrap();
        write_file(src_dir.path(), "Bundles2/_.index.bin", &index_raw);
        write_file(src_dir.path(), "Bundles2/X.bundle.bin", &bundle_raw);

        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(store_dir.path().to_path_buf());
        let em = ExtentMap::open_temporary().unwrap();
        let source = DiskSource::new(src_dir.path().to_path_buf());
        let progress = NoProgress::new();

        ingest_loose(&store, &em, &source, 5, 50, None, &progress)
            .await
            .unwrap();
        assert!(store.has_depot_fact(5, 50, DepotFact::HasBundles).unwrap());

        ingest_bundled(&store, &em, &IdentityDecompressor, 5, 50, &progress)
            .await
            .unwrap();
        assert!(store.has_depot_fact(5, 50, DepotFact::BundledIngested).unwrap());

        let rows: Vec<IndexRecord> = store
            .index_reader(5, 50, IndexKind::Bundled)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "Art/foo.dat");
        let expected_digest = Sha256Digest::from_bytes(b"DEFG");
        assert_eq!(rows[0].sha256, expected_digest.to_hex());

        let bundle_digest = Sha256Digest::from_bytes(&bundle_raw);
        assert_eq!(em.get_extent(&bundle_digest, 3, 4).unwrap(), Some(expected_digest));

        // Re-running both phases is a no-op: facts already set, indices
        // untouched.
        let before: Vec<IndexRecord> = store
            .index_reader(5, 50, IndexKind::Bundled)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        ingest_loose(&store, &em, &source, 5, 50, None, &progress)
            .await
            .unwrap();
        ingest_bundled(&store, &em, &IdentityDecompressor, 5, 50, &progress)
            .await
            .unwrap();
        let after: Vec<IndexRecord> = store
            .index_reader(5, 50, IndexKind::Bundled)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(before, after);
    }

    /// A depot tree containing a legacy `Content.ggpk` is ingested: loose
    /// ingest sets `has_pack` and expands the pack's files into
    /// loose-index rows addressed by the pack's own SHA-256 (files with
    /// an all-zero SHA-256 are skipped).
    #[tokio::test(flavor = "multi_thread")]
    async fn ggpk_pack_is_expanded_during_loose_ingest() {
        fn utf16le_name(s: &str) -> Vec<u8> {
            let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            out.extend([0u8, 0u8]);
            out
        }

        // Build a minimal GGPK: header -> root PDIR (one child) -> one FILE.
        let mut buf = Vec::new();
        let header_len = 28u32;
        let pdir_offset = header_len as u64;

        buf.extend(header_len.to_le_bytes());
        buf.extend(u32::from_le_bytes(*b"GGPK").to_le_bytes());
        buf.extend(3u32.to_le_bytes());
        buf.extend(pdir_offset.to_le_bytes());
        buf.extend(0u64.to_le_bytes());

        let dir_name = utf16le_name("");
        let file_name = utf16le_name("foo.dat");
        let payload = b"pack contents";
        let file_sha256 = Sha256Digest::from_bytes(payload);

        let pdir_fixed_len = 4 + 4 + 4 + 4 + 32 + dir_name.len() as u32 + (4 + 8);
        let file_offset = pdir_offset + pdir_fixed_len as u64;

        buf.extend(pdir_fixed_len.to_le_bytes());
        buf.extend(u32::from_le_bytes(*b"PDIR").to_le_bytes());
        buf.extend((dir_name.len() as u32 / 2).to_le_bytes());
        buf.extend(1u32.to_le_bytes());
        buf.extend([0u8; 32]);
        buf.extend_from_slice(&dir_name);
        buf.extend(0u32.to_le_bytes());
        buf.extend(file_offset.to_le_bytes());

        let file_rec_len = 4 + 4 + 4 + 32 + file_name.len() as u32 + payload.len() as u32;
        buf.extend(file_rec_len.to_le_bytes());
        buf.extend(u32::from_le_bytes(*b"FILE").to_le_bytes());
        buf.extend((file_name.len() as u32 / 2).to_le_bytes());
        buf.extend(file_sha256.0);
        buf.extend_from_slice(&file_name);
        buf.extend_from_slice(payload);

        // Sanity check our hand-built pack parses the way ggpk.rs expects.
        let mut pack = ggpk::PackSource::open(std::io::Cursor::new(buf.clone())).unwrap();
        let (&offset, _) = pack.files().next().unwrap();
        assert_eq!(pack.file_path(offset).as_deref(), Some("foo.dat"));

        let src_dir = camino_tempfile::tempdir().unwrap();
        write_file(src_dir.path(), "Content.ggpk", &buf);

        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(store_dir.path().to_path_buf());
        let em = ExtentMap::open_temporary().unwrap();
        let source = DiskSource::new(src_dir.path().to_path_buf());
        let progress = NoProgress::new();

        ingest_loose(&store, &em, &source, 7, 70, None, &progress)
            .await
            .unwrap();
        assert!(store.has_depot_fact(7, 70, DepotFact::HasPack).unwrap());

        let rows: Vec<IndexRecord> = store
            .index_reader(7, 70, IndexKind::Loose)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let packed_row = rows.iter().find(|r| r.path == "foo.dat").expect("packed file row present");
        assert_eq!(packed_row.sha256, file_sha256.to_hex());
        assert_eq!(store.read_data(&file_sha256).unwrap(), Some(payload.to_vec()));
    }

    /// Empty source: empty loose index, `loose_ingested` set, no objects
    /// written.
    #[tokio::test(flavor = "multi_thread")]
    async fn empty_source_produces_empty_index_and_no_objects() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(store_dir.path().to_path_buf());
        let em = ExtentMap::open_temporary().unwrap();
        let source = DiskSource::new(src_dir.path().to_path_buf());
        let progress = NoProgress::new();

        ingest_loose(&store, &em, &source, 9, 90, None, &progress)
            .await
            .unwrap();

        let rows: Vec<IndexRecord> = store
            .index_reader(9, 90, IndexKind::Loose)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(rows.is_empty());
        assert!(store.has_depot_fact(9, 90, DepotFact::LooseIngested).unwrap());
        assert!(!std::fs::metadata(store_dir.path().join("data")).map(|m| m.is_dir()).unwrap_or(false));
    }

    /// Bundled ingest is a no-op when the loose index never saw bundles
    /// (no `has_bundles` fact): it must not error just because there is
    /// nothing to expand.
    #[tokio::test(flavor = "multi_thread")]
    async fn bundled_ingest_without_bundles_fact_is_a_no_op() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        write_file(src_dir.path(), "a.txt", b"hello");
        let store_dir = camino_tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(store_dir.path().to_path_buf());
        let em = ExtentMap::open_temporary().unwrap();
        let source = DiskSource::new(src_dir.path().to_path_buf());
        let progress = NoProgress::new();

        ingest_loose(&store, &em, &source, 11, 110, None, &progress)
            .await
            .unwrap();
        assert!(!store.has_depot_fact(11, 110, DepotFact::HasBundles).unwrap());

        ingest_bundled(&store, &em, &IdentityDecompressor, 11, 110, &progress)
            .await
            .unwrap();
        assert!(!store.has_depot_fact(11, 110, DepotFact::BundledIngested).unwrap());
    }
}
