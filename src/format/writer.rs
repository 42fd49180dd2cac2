use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use super::{SampleRecord, TrackHeader, META_MAGIC, META_VERSION};

/// Writes one recording's `<id>.meta`/`<id>.mdat` pair. Both files are
/// created with a `.tmp` suffix and only renamed into place in
/// `finalize()`, so a crawler scanning the recordings tree never observes
/// a half-written recording under its final name.
pub struct SegmentWriter {
    dir: PathBuf,
    id: String,
    meta_tmp_path: PathBuf,
    mdat_tmp_path: PathBuf,
    meta: BufWriter<std::fs::File>,
    mdat: BufWriter<std::fs::File>,
    mdat_offset: u64,
    index: Vec<SampleRecord>,
    sha_meta: Sha256,
    sha_mdat: Sha256,
}

impl SegmentWriter {
    pub fn create(dir: &Path, id: &str, header: &TrackHeader) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating recording directory {}", dir.display()))?;

        let meta_tmp_path = dir.join(format!("{id}.meta.tmp"));
        let mdat_tmp_path = dir.join(format!("{id}.mdat.tmp"));

        let meta_file = std::fs::File::create(&meta_tmp_path)
            .with_context(|| format!("creating {}", meta_tmp_path.display()))?;
        let mdat_file = std::fs::File::create(&mdat_tmp_path)
            .with_context(|| format!("creating {}", mdat_tmp_path.display()))?;

        let mut writer = Self {
            dir: dir.to_path_buf(),
            id: id.to_string(),
            meta_tmp_path,
            mdat_tmp_path,
            meta: BufWriter::new(meta_file),
            mdat: BufWriter::new(mdat_file),
            mdat_offset: 0,
            index: Vec::new(),
            sha_meta: Sha256::new(),
            sha_mdat: Sha256::new(),
        };
        writer.write_header(header)?;
        Ok(writer)
    }

    fn write_header(&mut self, header: &TrackHeader) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_be_bytes());

        let monitor_id = header.monitor_id.as_bytes();
        buf.extend_from_slice(&(monitor_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(monitor_id);

        buf.extend_from_slice(&header.start_time_unix_ms.to_be_bytes());
        buf.extend_from_slice(&header.video_timescale.to_be_bytes());
        buf.extend_from_slice(&header.audio_timescale.to_be_bytes());

        buf.extend_from_slice(&(header.avc_config.len() as u16).to_be_bytes());
        buf.extend_from_slice(&header.avc_config);

        match &header.aac_config {
            Some(cfg) => {
                buf.extend_from_slice(&(cfg.len() as u16).to_be_bytes());
                buf.extend_from_slice(cfg);
            }
            None => buf.extend_from_slice(&0u16.to_be_bytes()),
        }

        self.sha_meta.update(&buf);
        self.meta.write_all(&buf)?;
        Ok(())
    }

    /// Appends one sample's raw bytes to `.mdat` and its index record to
    /// `.meta`. Returns the record so the caller (the recorder FSM) can
    /// use its offset for the `firstIDR` bookkeeping.
    pub fn append_sample(
        &mut self,
        flags: u8,
        pts_90k: i64,
        dts_90k: i64,
        data: &[u8],
    ) -> Result<SampleRecord> {
        let record = SampleRecord {
            flags,
            pts_90k,
            dts_90k,
            offset: self.mdat_offset,
            size: data.len() as u32,
        };

        self.sha_mdat.update(data);
        self.mdat.write_all(data)?;
        self.mdat_offset += data.len() as u64;

        let mut buf = Vec::with_capacity(super::SAMPLE_RECORD_LEN);
        record.encode(&mut buf);
        self.sha_meta.update(&buf);
        self.meta.write_all(&buf)?;

        self.index.push(record);
        Ok(record)
    }

    pub fn sample_count(&self) -> usize {
        self.index.len()
    }

    /// Flushes both files, appends a trailing checksum footer to `.meta`,
    /// and atomically renames both `.tmp` files into their final names.
    /// After this call the recording is visible to the crawler.
    pub fn finalize(mut self) -> Result<(PathBuf, PathBuf)> {
        self.meta.flush()?;
        self.mdat.flush()?;

        let meta_hash = self.sha_meta.clone().finalize();
        let mdat_hash = self.sha_mdat.clone().finalize();

        let mut footer = Vec::with_capacity(64);
        footer.extend_from_slice(&meta_hash);
        footer.extend_from_slice(&mdat_hash);
        self.meta.write_all(&footer)?;
        self.meta.flush()?;

        let meta_final = self.dir.join(format!("{}.meta", self.id));
        let mdat_final = self.dir.join(format!("{}.mdat", self.id));

        std::fs::rename(&self.mdat_tmp_path, &mdat_final)
            .with_context(|| format!("renaming {}", self.mdat_tmp_path.display()))?;
        std::fs::rename(&self.meta_tmp_path, &meta_final)
            .with_context(|| format!("renaming {}", self.meta_tmp_path.display()))?;

        Ok((meta_final, mdat_final))
    }

    /// Discards a recording that never produced a usable segment (e.g. the
    /// spec's rule that a segment not starting on an IDR is thrown away):
    /// removes both temp files instead of finalizing them.
    pub fn discard(self) -> Result<()> {
        let _ = std::fs::remove_file(&self.meta_tmp_path);
        let _ = std::fs::remove_file(&self.mdat_tmp_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reader::SegmentReader;
    use bytes::Bytes;

    fn header() -> TrackHeader {
        TrackHeader {
            monitor_id: "1".to_string(),
            start_time_unix_ms: 1_700_000_000_000,
            video_timescale: 90_000,
            avc_config: Bytes::from_static(&[1, 2, 3]),
            aac_config: None,
            audio_timescale: 0,
        }
    }

    #[test]
    fn write_then_read_round_trips_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::create(dir.path(), "seg-1", &header()).unwrap();
        w.append_sample(super::super::FLAG_KEYFRAME, 0, 0, &[0xaa; 10])
            .unwrap();
        w.append_sample(0, 3000, 3000, &[0xbb; 20]).unwrap();
        assert_eq!(w.sample_count(), 2);
        let (meta_path, mdat_path) = w.finalize().unwrap();
        assert!(meta_path.exists());
        assert!(mdat_path.exists());

        let reader = SegmentReader::open(&meta_path, &mdat_path).unwrap();
        assert_eq!(reader.samples().len(), 2);
        assert!(reader.samples()[0].is_keyframe());
        let data = reader.read_sample_data(&reader.samples()[1]).unwrap();
        assert_eq!(data.len(), 20);
    }

    #[test]
    fn discard_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let w = SegmentWriter::create(dir.path(), "seg-2", &header()).unwrap();
        w.discard().unwrap();
        assert!(!dir.path().join("seg-2.meta.tmp").exists());
        assert!(!dir.path().join("seg-2.mdat.tmp").exists());
    }

    #[test]
    fn corrupt_mdat_fails_checksum_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::create(dir.path(), "seg-3", &header()).unwrap();
        w.append_sample(super::super::FLAG_KEYFRAME, 0, 0, &[0xaa; 10])
            .unwrap();
        let (meta_path, mdat_path) = w.finalize().unwrap();

        let mut bytes = std::fs::read(&mdat_path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&mdat_path, bytes).unwrap();

        let err = SegmentReader::open(&meta_path, &mdat_path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    fn two_track_header() -> TrackHeader {
        TrackHeader {
            monitor_id: "cam-1".to_string(),
            start_time_unix_ms: 1_700_000_000_000,
            video_timescale: 90_000,
            avc_config: Bytes::from_static(&[0x01, 0x64, 0x00, 0x1f, 0xff]),
            aac_config: Some(Bytes::from_static(&[0x12, 0x10])),
            audio_timescale: 48_000,
        }
    }

    #[test]
    fn interleaved_audio_and_video_round_trip_preserves_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), "2024-01-01_00-00-00_cam-1", &two_track_header()).unwrap();

        writer.append_sample(super::super::FLAG_KEYFRAME, 0, 0, &[0xaa; 100]).unwrap();
        writer.append_sample(0, 3_000, 1_500, &[0xbb; 40]).unwrap();
        writer
            .append_sample(super::super::FLAG_AUDIO_SAMPLE, 1_024, 1_024, &[0xcc; 8])
            .unwrap();
        writer.append_sample(0, 6_000, 4_500, &[0xdd; 40]).unwrap();

        assert_eq!(writer.sample_count(), 4);
        let (meta_path, mdat_path) = writer.finalize().unwrap();

        let reader = SegmentReader::open(&meta_path, &mdat_path).unwrap();
        assert_eq!(reader.header.monitor_id, "cam-1");
        assert_eq!(reader.header.audio_timescale, 48_000);
        assert_eq!(reader.header.aac_config.as_deref(), Some(&[0x12, 0x10][..]));

        let samples = reader.samples();
        assert_eq!(samples.len(), 4);
        assert!(samples[0].is_keyframe());
        assert!(!samples[0].is_audio());
        assert!(samples[2].is_audio());
        assert_eq!(reader.first_keyframe_index(), Some(0));

        // Non-monotonic DTS across the stream (the audio sample lands
        // between video frames in wall-clock order) doesn't disturb append
        // order — the index is a flat log, not resorted on read.
        let deltas: Vec<i64> = samples.iter().map(|s| s.dts_90k).collect();
        assert_eq!(deltas, vec![0, 1_500, 1_024, 4_500]);

        for (i, expected_len) in [100usize, 40, 8, 40].into_iter().enumerate() {
            let data = reader.read_sample_data(&samples[i]).unwrap();
            assert_eq!(data.len(), expected_len);
        }
        let last = reader.read_sample_data(&samples[3]).unwrap();
        assert!(last.iter().all(|&b| b == 0xdd));
    }

    #[test]
    fn discarded_recording_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::create(dir.path(), "2024-01-01_00-00-00_cam-3", &two_track_header()).unwrap();
        writer.discard().unwrap();

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none(), "discard should leave the directory empty");
    }
}
