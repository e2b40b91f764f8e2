use anyhow::Context;
use clap::{Parser, Subcommand};
use log::warn;
use std::path::{Path, PathBuf};

use crate::broadcast::Dispatch;
use crate::config;
use crate::domain::aggregate::AggregateKind;
use crate::domain::hash::{AggregateId, TrackId};
use crate::domain::track::TrackInput;
use crate::engine::library::Library;
use crate::storage::db::i64_seconds_to_local_time;
use crate::storage::error::StorageError;

#[derive(Parser)]
#[command(name = "trackshelf")]
#[command(version = "0.1")]
#[command(about = "Music library with incrementally maintained albums, artists and playlists")]
pub struct Cli {
    /// Path to the config TOML file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show library status
    Status,
    /// Add or re-scan tracks from a JSON array of track inputs
    Add { file: PathBuf },
    /// Remove tracks by id
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List tracks, albums, artists or playlists as JSON lines
    List { what: String },
    /// Manage playlists
    Playlist {
        #[command(subcommand)]
        command: PlaylistCommands,
    },
    /// Set the cover of an album or playlist, or an artist's avatar.
    /// Omit the media path to clear it.
    Cover {
        kind: AggregateKind,
        id: AggregateId,
        media: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum PlaylistCommands {
    Create {
        name: String,
        #[arg(required = true)]
        tracks: Vec<String>,
    },
    Add {
        id: AggregateId,
        #[arg(required = true)]
        tracks: Vec<String>,
    },
    Remove {
        id: AggregateId,
        #[arg(required = true)]
        tracks: Vec<String>,
    },
    Rename { id: AggregateId, name: String },
    Delete { id: AggregateId },
}

fn parse_track_ids(ids: &[String]) -> Result<Vec<TrackId>, StorageError> {
    ids.iter()
        .map(|id| TrackId::from_hex(id).map_err(|_| StorageError::InvalidTrackId))
        .collect()
}

fn read_inputs(path: &Path) -> anyhow::Result<Vec<TrackInput>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read track inputs {}", path.to_string_lossy()))?;
    serde_json::from_str(&contents).with_context(|| "Failed to parse track inputs JSON")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Entrypoint for CLI
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = config::Config::load(&cli.config)?;
    let library = Library::open(&cfg)?;

    library.subscribe(|dispatch: &Dispatch| match serde_json::to_string(dispatch) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("could not encode {} dispatch: {e}", dispatch.event_type),
    });

    match cli.command {
        Commands::Status => {
            let updated = match library.last_update()? {
                Some(at) => i64_seconds_to_local_time(at)?.to_string(),
                None => "never".to_string(),
            };
            println!("Library was updated {updated}");
            println!("  tracks:    {}", library.tracks().count()?);
            for kind in AggregateKind::ALL {
                println!("  {:<10} {}", format!("{kind}s:"), library.store(kind).count()?);
            }
        }

        Commands::Add { file } => {
            let report = library.add(read_inputs(&file)?)?;
            println!(
                "Saved {} tracks, {} new albums, {} new artists",
                report.tracks.len(),
                report.albums.created.len(),
                report.artists.created.len()
            );
        }

        Commands::Remove { ids } => {
            let report = library.remove(&parse_track_ids(&ids)?)?;
            println!(
                "Removed {} tracks, {} albums and {} artists emptied",
                report.tracks.len(),
                report.albums.removed_ids.len(),
                report.artists.removed_ids.len()
            );
        }

        Commands::List { what } => {
            if matches!(what.to_lowercase().as_str(), "track" | "tracks") {
                for track in library.tracks().list()? {
                    print_json(&track)?;
                }
            } else {
                let kind: AggregateKind = what.parse()?;
                for aggregate in library.store(kind).list()? {
                    print_json(&aggregate)?;
                }
            }
        }

        Commands::Playlist { command } => match command {
            PlaylistCommands::Create { name, tracks } => {
                print_json(&library.create_playlist(&name, &parse_track_ids(&tracks)?)?)?;
            }
            PlaylistCommands::Add { id, tracks } => {
                print_json(&library.add_to_playlist(id, &parse_track_ids(&tracks)?)?)?;
            }
            PlaylistCommands::Remove { id, tracks } => {
                match library.remove_from_playlist(id, &parse_track_ids(&tracks)?)? {
                    Some(playlist) => print_json(&playlist)?,
                    None => println!("Playlist {id} is empty and was deleted"),
                }
            }
            PlaylistCommands::Rename { id, name } => {
                print_json(&library.rename_playlist(id, &name)?)?;
            }
            PlaylistCommands::Delete { id } => {
                if !library.delete_playlist(id)? {
                    println!("No playlist {id}");
                }
            }
        },

        Commands::Cover { kind, id, media } => {
            print_json(&library.set_cover(kind, id, media)?)?;
        }
    }

    library.flush();
    Ok(())
}
