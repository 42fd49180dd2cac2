use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{SampleRecord, TrackHeader, META_MAGIC, SAMPLE_RECORD_LEN};

const FOOTER_LEN: usize = 32 + 32; // sha256(meta body) || sha256(mdat)

/// Read-only view over a finalized `<id>.meta`/`<id>.mdat` pair, as used
/// by the crawler (listing samples without loading sample bytes) and by
/// `mp4gen` (regenerating a playable MP4 on demand).
pub struct SegmentReader {
    pub header: TrackHeader,
    samples: Vec<SampleRecord>,
    mdat: memmap_or_read::MdatSource,
}

mod memmap_or_read {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::Path;

    use anyhow::{Context, Result};

    /// Plain buffered-read access to the `.mdat` file. A memory-mapped
    /// implementation would avoid the copy on every `read_sample_data`
    /// call; kept as a named seam so that optimization can land later
    /// without touching `SegmentReader`'s public API.
    pub struct MdatSource {
        file: File,
    }

    impl MdatSource {
        pub fn open(path: &Path) -> Result<Self> {
            Ok(Self {
                file: File::open(path).with_context(|| format!("opening {}", path.display()))?,
            })
        }

        pub fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
            let mut file = self.file.try_clone()?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        }
    }
}

impl SegmentReader {
    pub fn open(meta_path: &Path, mdat_path: &Path) -> Result<Self> {
        let mut meta_bytes = Vec::new();
        std::fs::File::open(meta_path)
            .with_context(|| format!("opening {}", meta_path.display()))?
            .read_to_end(&mut meta_bytes)?;

        if meta_bytes.len() < FOOTER_LEN {
            bail!("meta file shorter than the trailing checksum footer");
        }
        let body_len = meta_bytes.len() - FOOTER_LEN;
        let body = &meta_bytes[..body_len];
        let footer = &meta_bytes[body_len..];

        let meta_hash = Sha256::digest(body);
        if meta_hash.as_slice() != &footer[0..32] {
            bail!("meta file checksum mismatch, recording is corrupt");
        }
        let mdat_bytes = std::fs::read(mdat_path)
            .with_context(|| format!("opening {}", mdat_path.display()))?;
        let mdat_hash = Sha256::digest(&mdat_bytes);
        if mdat_hash.as_slice() != &footer[32..64] {
            bail!("mdat file checksum mismatch, recording is corrupt");
        }

        if body.len() < 4 || &body[0..4] != META_MAGIC {
            bail!("bad meta magic");
        }
        let version = u16::from_be_bytes(body[4..6].try_into().unwrap());
        if version != super::META_VERSION {
            bail!("unsupported meta version {}", version);
        }

        let mut pos = 6usize;
        let monitor_id_len = u16::from_be_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let monitor_id = String::from_utf8(body[pos..pos + monitor_id_len].to_vec())
            .context("monitor id is not valid utf-8")?;
        pos += monitor_id_len;

        let start_time_unix_ms = i64::from_be_bytes(body[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let video_timescale = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let audio_timescale = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;

        let avc_len = u16::from_be_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let avc_config = Bytes::copy_from_slice(&body[pos..pos + avc_len]);
        pos += avc_len;

        let aac_len = u16::from_be_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let aac_config = if aac_len > 0 {
            Some(Bytes::copy_from_slice(&body[pos..pos + aac_len]))
        } else {
            None
        };
        pos += aac_len;

        let mut samples = Vec::new();
        while pos + SAMPLE_RECORD_LEN <= body.len() {
            samples.push(SampleRecord::decode(&body[pos..pos + SAMPLE_RECORD_LEN])?);
            pos += SAMPLE_RECORD_LEN;
        }
        if pos != body.len() {
            bail!("meta file has a trailing partial sample record");
        }

        let mdat = memmap_or_read::MdatSource::open(mdat_path)?;

        Ok(Self {
            header: TrackHeader {
                monitor_id,
                start_time_unix_ms,
                video_timescale,
                avc_config,
                aac_config,
                audio_timescale,
            },
            samples,
            mdat,
        })
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn read_sample_data(&self, record: &SampleRecord) -> Result<Vec<u8>> {
        self.mdat.read_at(record.offset, record.size)
    }

    /// First keyframe index, used by the recorder to discard a recording
    /// whose first sample isn't an IDR.
    pub fn first_keyframe_index(&self) -> Option<usize> {
        self.samples.iter().position(|s| s.is_keyframe())
    }
}
