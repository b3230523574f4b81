//! Lightweight CLI client for ipodd over TCP

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use ipoddb_core::query::{Field, Filter, Query, QueryType, TextMatch};
use ipoddb_core::validate::validate_and_print;

#[derive(Parser)]
#[command(name = "ipodctl")]
#[command(about = "iPod database CLI")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7455")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Status,
    Info,
    Artists,
    Albums {
        artist: String,
    },
    Tracks {
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        album: Option<String>,
    },
    Playlists,
    Playlist {
        title: String,
    },
    CreatePlaylist {
        title: String,
    },
    RenamePlaylist {
        title: String,
        new_title: String,
    },
    DeletePlaylist {
        title: String,
    },
    AddToPlaylist {
        title: String,
        track_id: u32,
    },
    /// Clear the entry at a 0-based position
    RemoveFromPlaylist {
        title: String,
        position: u32,
    },
    RenameAlbum {
        artist: String,
        album: String,
        new_artist: String,
        new_album: String,
    },
    DeleteAlbum {
        artist: String,
        album: String,
    },
    DeleteArtist {
        artist: String,
    },
    DeleteTrack {
        track_id: u32,
    },
    MoveTrack {
        track_id: u32,
        artist: String,
        album: String,
    },
    /// Tracks whose title, artist or album contain the text
    Search {
        text: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Run a query given as JSON
    Query {
        json: String,
    },
    RenameDevice {
        name: String,
    },
    /// Write pending changes to the device
    Write,
    /// Check an iTunesDB file locally, without the server
    Validate {
        file: PathBuf,
    },
}

#[derive(Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum Request {
    Status,
    Info,
    Artists,
    Albums { artist: String },
    Tracks {
        artist: Option<String>,
        album: Option<String>,
    },
    Playlists,
    Playlist { title: String },
    CreatePlaylist { title: String },
    RenamePlaylist { title: String, new_title: String },
    DeletePlaylist { title: String },
    AddToPlaylist { title: String, track_id: u32 },
    RemoveFromPlaylist { title: String, position: u32 },
    RenameAlbum {
        artist: String,
        album: String,
        new_artist: String,
        new_album: String,
    },
    DeleteAlbum { artist: String, album: String },
    DeleteArtist { artist: String },
    DeleteTrack { track_id: u32 },
    MoveTrack {
        track_id: u32,
        artist: String,
        album: String,
    },
    Query { query: Query },
    RenameDevice { name: String },
    Write,
}

#[derive(Deserialize)]
struct Response {
    success: bool,
    code: Option<String>,
    message: Option<String>,
    data: Option<serde_json::Value>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn search_query(text: String, limit: Option<usize>) -> Query {
    let fields = [Field::Title, Field::Artist, Field::Album];
    Query {
        query_type: QueryType::Tracks,
        filters: fields
            .iter()
            .map(|&field| Filter::text(field, text.clone(), TextMatch::Contains))
            .collect(),
        match_any: true,
        order_by: Some(Field::Artist),
        limit,
        ..Query::default()
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let request = match cli.command {
        Commands::Validate { file } => {
            let data = std::fs::read(&file)
                .map_err(|e| format!("Cannot read {:?}: {}", file, e))?;
            if !validate_and_print(&data) {
                std::process::exit(1);
            }
            return Ok(());
        }
        Commands::Status => Request::Status,
        Commands::Info => Request::Info,
        Commands::Artists => Request::Artists,
        Commands::Albums { artist } => Request::Albums { artist },
        Commands::Tracks { artist, album } => Request::Tracks { artist, album },
        Commands::Playlists => Request::Playlists,
        Commands::Playlist { title } => Request::Playlist { title },
        Commands::CreatePlaylist { title } => Request::CreatePlaylist { title },
        Commands::RenamePlaylist { title, new_title } => {
            Request::RenamePlaylist { title, new_title }
        }
        Commands::DeletePlaylist { title } => Request::DeletePlaylist { title },
        Commands::AddToPlaylist { title, track_id } => Request::AddToPlaylist { title, track_id },
        Commands::RemoveFromPlaylist { title, position } => {
            Request::RemoveFromPlaylist { title, position }
        }
        Commands::RenameAlbum {
            artist,
            album,
            new_artist,
            new_album,
        } => Request::RenameAlbum {
            artist,
            album,
            new_artist,
            new_album,
        },
        Commands::DeleteAlbum { artist, album } => Request::DeleteAlbum { artist, album },
        Commands::DeleteArtist { artist } => Request::DeleteArtist { artist },
        Commands::DeleteTrack { track_id } => Request::DeleteTrack { track_id },
        Commands::MoveTrack {
            track_id,
            artist,
            album,
        } => Request::MoveTrack {
            track_id,
            artist,
            album,
        },
        Commands::Search { text, limit } => Request::Query {
            query: search_query(text, limit),
        },
        Commands::Query { json } => Request::Query {
            query: serde_json::from_str(&json).map_err(|e| format!("Invalid query: {}", e))?,
        },
        Commands::RenameDevice { name } => Request::RenameDevice { name },
        Commands::Write => Request::Write,
    };

    let mut stream = TcpStream::connect(&cli.addr)
        .map_err(|e| format!("Cannot connect to server at {}: {}", cli.addr, e))?;

    let request_json = serde_json::to_string(&request)?;
    writeln!(stream, "{}", request_json)?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Response = serde_json::from_str(&response_line)?;

    if response.success {
        if let Some(msg) = response.message {
            println!("✓ {}", msg);
        }

        if let Some(data) = response.data {
            print_data(&data, &request);
        }
    } else {
        match (response.code, response.message) {
            (Some(code), Some(msg)) => eprintln!("✗ [{}] {}", code, msg),
            (None, Some(msg)) => eprintln!("✗ {}", msg),
            _ => eprintln!("✗ request failed"),
        }
        std::process::exit(1);
    }

    Ok(())
}

fn print_tracks(tracks: &[serde_json::Value]) {
    for track in tracks {
        let id = track.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
        let title = track.get("title").and_then(|v| v.as_str()).unwrap_or("?");
        let artist = track.get("artist").and_then(|v| v.as_str()).unwrap_or("?");
        let album = track.get("album").and_then(|v| v.as_str()).unwrap_or("?");
        println!("  {:5}. {} - {} ({})", id, artist, title, album);
    }
}

fn print_data(data: &serde_json::Value, request: &Request) {
    match request {
        Request::Tracks { .. } => {
            if let Some(tracks) = data.as_array() {
                print_tracks(tracks);
            }
        }
        Request::Query { .. } if data.get("type").and_then(|t| t.as_str()) == Some("tracks") => {
            if let Some(tracks) = data.get("items").and_then(|i| i.as_array()) {
                print_tracks(tracks);
            }
        }
        Request::Artists => {
            for artist in data.as_array().into_iter().flatten() {
                println!("  {}", artist.as_str().unwrap_or("?"));
            }
        }
        Request::Playlist { .. } => {
            let entries = data.get("entries").and_then(|e| e.as_array());
            for (position, id) in entries.into_iter().flatten().enumerate() {
                match id.as_u64() {
                    Some(0) => println!("  {:3}. (removed)", position),
                    Some(id) => println!("  {:3}. track {}", position, id),
                    None => {}
                }
            }
        }
        _ => {
            // Pretty print JSON for everything else
            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
        }
    }
}
