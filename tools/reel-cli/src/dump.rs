//! Print the entries of one snapshot

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use nether_reel::{ObjectId, Snapshot, StorageConfig, Storable};
use serde_json::json;

use crate::stream;

/// Arguments for the dump command
#[derive(Args)]
pub struct DumpArgs {
    /// Stream file (.nreel)
    pub file: PathBuf,

    /// Snapshot sequence id (defaults to the first snapshot)
    #[arg(long, conflicts_with = "time")]
    pub seq: Option<u32>,

    /// Latest snapshot at or before this time, in seconds
    #[arg(long)]
    pub time: Option<f32>,

    /// Show entries as stored, with pointers left unresolved
    #[arg(long)]
    pub raw: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: DumpArgs, config: StorageConfig) -> Result<()> {
    let mut storage = stream::open(&args.file, config)?;
    let Some(first) = storage.table().first().copied() else {
        bail!("Stream has no snapshots");
    };

    if args.raw {
        let entry = match (args.seq, args.time) {
            (Some(seq), _) => storage.table().find_by_sequence(seq).copied(),
            (None, Some(time)) => storage.table().find_by_time(time).copied(),
            (None, None) => Some(first),
        };
        let Some(entry) = entry else {
            bail!("No segment holds sequence {}", args.seq.unwrap_or_default());
        };
        let segment = storage
            .load_raw_segment(&entry)
            .with_context(|| format!("Failed to load segment {}", entry.segment_id))?;
        let snapshot = match (args.seq, args.time) {
            (Some(seq), _) => segment.snapshots().find(|s| s.sequence() == seq),
            (None, Some(time)) => segment
                .snapshots()
                .filter(|s| s.timestamp() <= time)
                .last()
                .or(segment.start()),
            (None, None) => segment.start(),
        };
        match snapshot {
            Some(snapshot) => print_snapshot(snapshot, args.json)?,
            None => println!("Sequence {} not found", args.seq.unwrap_or_default()),
        }
        storage.recycle_segment(segment)?;
    } else {
        let snapshot = match (args.seq, args.time) {
            (Some(seq), _) => storage.fetch_by_sequence(seq)?,
            (None, Some(time)) => storage.fetch_by_time(time)?,
            (None, None) => storage.fetch_by_sequence(first.start_sequence)?,
        };
        let Some(snapshot) = snapshot else {
            bail!("Sequence {} not found", args.seq.unwrap_or_default());
        };
        print_snapshot(snapshot, args.json)?;
    }

    storage.finish()?;
    Ok(())
}

fn sorted_entries(snapshot: &Snapshot) -> Vec<(ObjectId, &Storable)> {
    let mut entries: Vec<_> = snapshot.entries().collect();
    entries.sort_unstable_by_key(|(id, _)| *id);
    entries
}

fn print_snapshot(snapshot: &Snapshot, as_json: bool) -> Result<()> {
    let entries = sorted_entries(snapshot);

    if as_json {
        let entries: Vec<_> = entries
            .iter()
            .map(|(id, storable)| match storable {
                Storable::State(state) => json!({
                    "id": id.raw(),
                    "state": {
                        "len": state.size(),
                        "hash": format!("{:016x}", state.content_hash()),
                    },
                }),
                Storable::Pointer(target) => json!({
                    "id": id.raw(),
                    "pointer": target,
                }),
            })
            .collect();
        let value = json!({
            "sequence": snapshot.sequence(),
            "timestamp": snapshot.timestamp(),
            "size": snapshot.size_bytes(),
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "=== Snapshot {} at {:.3}s ===",
        snapshot.sequence(),
        snapshot.timestamp()
    );
    println!("Entries: {}", entries.len());
    println!("Size: {} bytes", snapshot.size_bytes());
    println!();
    for (id, storable) in entries {
        match storable {
            Storable::State(state) => println!(
                "  {:>10}  state    {:>6} bytes  {:016x}",
                id.raw(),
                state.size(),
                state.content_hash()
            ),
            Storable::Pointer(target) => {
                println!("  {:>10}  pointer  -> snapshot {}", id.raw(), target)
            }
        }
    }
    Ok(())
}
