//! Component I: answers ordered time-range queries over finalized
//! recordings without needing a database. Recordings are laid out
//! `<root>/YYYY/MM/DD/<monitor_id>/<id>.meta` (see `recorder::day_dir`)
//! with `<id>` built from the monitor id and a sortable timestamp
//! (`recorder::Recorder::open`), so a purely lexicographic directory
//! walk already yields time order; nothing here needs to open a file to
//! sort it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::format::reader::SegmentReader;

#[derive(Debug, Clone)]
pub struct RecordingEntry {
    pub id: String,
    pub monitor_id: String,
    pub meta_path: PathBuf,
    pub mdat_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Unix-ms cursor. With `reverse == false`, only recordings whose id
    /// sorts at or after this timestamp are returned (recordings start
    /// here or later); with `reverse == true`, at or before.
    pub time: Option<i64>,
    pub limit: Option<usize>,
    pub reverse: bool,
    /// Empty means "all monitors".
    pub monitors: Vec<String>,
    pub include_data: bool,
}

pub struct RecordingData {
    pub entry: RecordingEntry,
    pub reader: SegmentReader,
}

/// Walks the recordings tree and returns matching entries in the
/// direction `query.reverse` asks for, most-recent-first when reversed.
pub fn query(root: &Path, query: &Query) -> Result<Vec<RecordingEntry>> {
    let mut years = list_dirs(root)?;
    sort_for(&mut years, query.reverse);

    let mut out = Vec::new();
    'outer: for year in &years {
        let mut months = list_dirs(year)?;
        sort_for(&mut months, query.reverse);
        for month in &months {
            let mut days = list_dirs(month)?;
            sort_for(&mut days, query.reverse);
            for day in &days {
                let mut monitor_dirs = list_dirs(day)?;
                sort_for(&mut monitor_dirs, query.reverse);
                for monitor_dir in &monitor_dirs {
                    let monitor_id = monitor_dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string();
                    if !query.monitors.is_empty() && !query.monitors.contains(&monitor_id) {
                        continue;
                    }
                    let mut entries = list_recordings(monitor_dir, &monitor_id)?;
                    sort_entries_for(&mut entries, query.reverse);
                    for entry in entries {
                        if let Some(cursor) = query.time {
                            // Strict: a recording whose id's timestamp equals
                            // the cursor exactly is excluded (spec.md §4.I),
                            // not just anything on the wrong side of it.
                            let ts = recording_timestamp_ms(&entry.id);
                            let in_range = if query.reverse {
                                ts.map(|t| t < cursor).unwrap_or(true)
                            } else {
                                ts.map(|t| t > cursor).unwrap_or(true)
                            };
                            if !in_range {
                                continue;
                            }
                        }
                        out.push(entry);
                        if let Some(limit) = query.limit {
                            if out.len() >= limit {
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Same as `query`, but opens each matching recording's `.meta`/`.mdat`
/// pair for callers that asked for `includeData`.
pub fn query_with_data(root: &Path, q: &Query) -> Result<Vec<RecordingData>> {
    let entries = query(root, q)?;
    entries
        .into_iter()
        .map(|entry| {
            let reader = SegmentReader::open(&entry.meta_path, &entry.mdat_path)
                .with_context(|| format!("opening recording {}", entry.id))?;
            Ok(RecordingData { entry, reader })
        })
        .collect()
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("reading directory {}", dir.display())),
    };
    for entry in rd {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn list_recordings(monitor_dir: &Path, monitor_id: &str) -> Result<Vec<RecordingEntry>> {
    let mut out = Vec::new();
    let rd = match std::fs::read_dir(monitor_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("reading directory {}", monitor_dir.display())),
    };
    for entry in rd {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let mdat_path = path.with_extension("mdat");
        if !mdat_path.exists() {
            // A `.meta` without its `.mdat` sibling is a recording that
            // was interrupted mid-rename; SegmentWriter::finalize renames
            // .mdat before .meta, so this should never actually happen,
            // but skip defensively rather than fail the whole query.
            continue;
        }
        out.push(RecordingEntry {
            id,
            monitor_id: monitor_id.to_string(),
            meta_path: path,
            mdat_path,
        });
    }
    Ok(out)
}

fn sort_for(paths: &mut [PathBuf], reverse: bool) {
    paths.sort();
    if reverse {
        paths.reverse();
    }
}

fn sort_entries_for(entries: &mut [RecordingEntry], reverse: bool) {
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    if reverse {
        entries.reverse();
    }
}

/// Recording ids are `YYYY-MM-DD_hh-mm-ss_<monitorID>` (§3); the leading
/// 19 bytes are the fixed-width timestamp, sorting and parsing the same
/// way regardless of what follows in the monitor id suffix.
fn recording_timestamp_ms(id: &str) -> Option<i64> {
    let ts = id.get(0..19)?;
    let naive = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%d_%H-%M-%S").ok()?;
    Some(naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// `date` is `YYYY-MM-DD_hh-mm-ss`, matching `recorder::Recorder::open`'s
    /// id construction.
    fn touch_recording(root: &Path, monitor: &str, date: &str) {
        let year = &date[0..4];
        let month = &date[5..7];
        let day = &date[8..10];
        let dir = root.join(year).join(month).join(day).join(monitor);
        fs::create_dir_all(&dir).unwrap();
        let id = format!("{date}_{monitor}");
        fs::write(dir.join(format!("{id}.meta")), b"x").unwrap();
        fs::write(dir.join(format!("{id}.mdat")), b"y").unwrap();
    }

    #[test]
    fn lists_recordings_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        touch_recording(dir.path(), "1", "2024-01-02_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-01_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-03_00-00-00");

        let results = query(dir.path(), &Query::default()).unwrap();
        let ids: Vec<_> = results.iter().map(|e| e.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                "2024-01-01_00-00-00_1",
                "2024-01-02_00-00-00_1",
                "2024-01-03_00-00-00_1",
            ]
        );
    }

    #[test]
    fn reverse_query_returns_most_recent_first_and_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        touch_recording(dir.path(), "1", "2024-01-01_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-02_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-03_00-00-00");

        let results = query(
            dir.path(),
            &Query {
                reverse: true,
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "2024-01-03_00-00-00_1");
        assert_eq!(results[1].id, "2024-01-02_00-00-00_1");
    }

    #[test]
    fn filters_by_monitor() {
        let dir = tempfile::tempdir().unwrap();
        touch_recording(dir.path(), "1", "2024-01-01_00-00-00");
        touch_recording(dir.path(), "2", "2024-01-01_00-00-00");

        let results = query(
            dir.path(),
            &Query {
                monitors: vec!["2".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].monitor_id, "2");
    }

    #[test]
    fn time_cursor_excludes_earlier_recordings_in_forward_order() {
        let dir = tempfile::tempdir().unwrap();
        touch_recording(dir.path(), "1", "2024-01-01_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-02_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-03_00-00-00");

        // A cursor that falls strictly between two ids: the closest id on
        // the requested (forward) side comes first.
        let cursor = recording_timestamp_ms("2024-01-01_12-00-00_1").unwrap();
        let results = query(
            dir.path(),
            &Query {
                time: Some(cursor),
                ..Default::default()
            },
        )
        .unwrap();
        let ids: Vec<_> = results.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["2024-01-02_00-00-00_1", "2024-01-03_00-00-00_1"]);
    }

    /// spec.md §4.I: "When `time` equals an existing recording id, that id
    /// is excluded (strict)".
    #[test]
    fn time_cursor_matching_an_existing_id_excludes_that_id() {
        let dir = tempfile::tempdir().unwrap();
        touch_recording(dir.path(), "1", "2024-01-01_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-02_00-00-00");
        touch_recording(dir.path(), "1", "2024-01-03_00-00-00");

        let cursor = recording_timestamp_ms("2024-01-02_00-00-00_1").unwrap();
        let forward = query(
            dir.path(),
            &Query {
                time: Some(cursor),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            forward.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            vec!["2024-01-03_00-00-00_1"]
        );

        let backward = query(
            dir.path(),
            &Query {
                time: Some(cursor),
                reverse: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            backward.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            vec!["2024-01-01_00-00-00_1"]
        );
    }

    /// Unlike `touch_recording`'s placeholder `.meta`/`.mdat` files (empty
    /// stand-ins for ordering/filter tests above), this writes real
    /// recordings through `SegmentWriter` the way `recorder::Recorder`
    /// does, so `query_with_data` has a real sample index to open.
    fn write_recording(root: &Path, monitor_id: &str, date: &str, sample_bytes: &[u8]) {
        use crate::format::writer::SegmentWriter;
        use crate::format::{TrackHeader, FLAG_KEYFRAME};
        use bytes::Bytes;

        let year = &date[0..4];
        let month = &date[5..7];
        let day = &date[8..10];
        let dir = root.join(year).join(month).join(day).join(monitor_id);

        let header = TrackHeader {
            monitor_id: monitor_id.to_string(),
            start_time_unix_ms: 0,
            video_timescale: 90_000,
            avc_config: Bytes::from_static(&[0x01]),
            aac_config: None,
            audio_timescale: 0,
        };
        let id = format!("{date}_{monitor_id}");
        let mut writer = SegmentWriter::create(&dir, &id, &header).unwrap();
        writer.append_sample(FLAG_KEYFRAME, 0, 0, sample_bytes).unwrap();
        writer.finalize().unwrap();
    }

    #[test]
    fn query_with_data_opens_every_matching_recording() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "front-door", "2024-06-01_08-00-00", &[0x01; 32]);
        write_recording(dir.path(), "front-door", "2024-06-01_09-00-00", &[0x02; 64]);
        write_recording(dir.path(), "backyard", "2024-06-01_08-30-00", &[0x03; 16]);

        let results = query_with_data(dir.path(), &Query::default()).unwrap();
        assert_eq!(results.len(), 3);

        // Lexicographic directory order already yields chronological order
        // across monitors, since the day/month/year path components sort
        // before the monitor id does.
        let ids: Vec<_> = results.iter().map(|r| r.entry.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                "2024-06-01_08-00-00_front-door",
                "2024-06-01_08-30-00_backyard",
                "2024-06-01_09-00-00_front-door",
            ]
        );

        for r in &results {
            assert_eq!(r.reader.samples().len(), 1);
        }
    }
}
