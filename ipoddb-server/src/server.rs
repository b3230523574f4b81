//! TCP server for CLI communication
//!
//! Provides a simple JSON-RPC style interface: one request object per line,
//! one response object per line. The device is owned by a single [`IPod`]
//! behind an async mutex and is brought up to date with other processes
//! before every request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ipoddb_core::path::unescape_slashes;
use ipoddb_core::track::unix_from_mac;
use ipoddb_core::{Error, IPod, Query, QueryMaker, Track};

use crate::config::Config;

/// Server state
struct ServerState {
    config: Config,
    ipod: IPod,
}

impl ServerState {
    fn new(config: Config) -> Self {
        Self {
            config,
            ipod: IPod::new(),
        }
    }

    /// Open the device or catch up with changes made by other processes
    fn sync(&mut self) -> ipoddb_core::Result<()> {
        if !self.ipod.is_open() {
            return self.ipod.open(&self.config.mountpoint);
        }
        if !self.ipod.ensure_consistency()? {
            info!("Device database was rewritten, re-opening {:?}", self.config.mountpoint);
            self.ipod.open(&self.config.mountpoint)?;
        }
        Ok(())
    }
}

/// Request from CLI client
#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
#[serde(rename_all = "snake_case")]
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

/// Response to CLI client
#[derive(Debug, Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: None,
            message: Some(message.into()),
            data: None,
        }
    }

    fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            code: None,
            message: Some(message.into()),
            data: Some(data),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: None,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Failure carrying the engine's result code
    fn failure(err: &Error) -> Self {
        Self {
            success: false,
            code: Some(err.code().to_string()),
            message: Some(err.to_string()),
            data: None,
        }
    }

    fn from_result(result: ipoddb_core::Result<()>, message: impl Into<String>) -> Self {
        match result {
            Ok(()) => Self::ok(message),
            Err(e) => Self::failure(&e),
        }
    }
}

/// Run the server until interrupted
pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on {}", config.bind_addr);

    let mut state = ServerState::new(config);
    if let Err(e) = state.sync() {
        warn!("Device not available yet: {}", e);
    }
    let state = Arc::new(Mutex::new(state));

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Client connected from {}", addr);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, state).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    shutdown(&state).await
}

async fn shutdown(state: &Arc<Mutex<ServerState>>) -> anyhow::Result<()> {
    let mut guard = state.lock().await;
    if !guard.ipod.is_open() {
        return Ok(());
    }
    if guard.config.write_on_shutdown && guard.ipod.has_pending_changes() {
        if guard.ipod.is_still_connected() {
            guard.ipod.write_itunes_db()?;
            info!("Pending changes written to {:?}", guard.config.mountpoint);
        } else {
            warn!("Device database was rewritten by another process, pending changes dropped");
        }
    }
    guard.ipod.close()?;
    Ok(())
}

/// Handle a single client connection
async fn handle_client(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        debug!("Received: {}", line.trim());

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(request, &state).await,
            Err(e) => Response::error(format!("Invalid request: {}", e)),
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

fn track_json(track: &Track) -> serde_json::Value {
    serde_json::json!({
        "id": track.id,
        "title": track.title(),
        "artist": track.artist(),
        "album": track.album(),
        "genre": track.genre(),
        "track_number": track.track_number,
        "year": track.year,
        "length_ms": track.length_ms,
        "play_count": track.play_count,
        "date_added": unix_from_mac(track.date_added),
        "path": track.path(),
    })
}

/// Process a request
async fn handle_request(request: Request, state: &Arc<Mutex<ServerState>>) -> Response {
    let mut guard = state.lock().await;

    if let Request::Status = request {
        return Response::ok_with_data(
            "Server running",
            serde_json::json!({
                "open": guard.ipod.is_open(),
                "mountpoint": guard.config.mountpoint,
                "pending_changes": guard.ipod.has_pending_changes(),
            }),
        );
    }

    if let Err(e) = guard.sync() {
        return Response::failure(&e);
    }
    let ipod = &mut guard.ipod;

    match request {
        Request::Status => Response::ok("Server running"),

        Request::Info => {
            let db = ipod.database();
            let snapshot = ipod.snapshot();
            Response::ok_with_data(
                ipod.name().to_string(),
                serde_json::json!({
                    "name": ipod.name(),
                    "mountpoint": ipod.mountpoint(),
                    "tracks": db.num_tracks(),
                    "artists": db.artists().count(),
                    "playlists": db.playlist_titles().count(),
                    "max_track_id": db.max_track_id(),
                    "log_cursor": snapshot.cursor,
                    "pending_changes": ipod.has_pending_changes(),
                }),
            )
        }

        Request::Artists => {
            let artists: Vec<String> = ipod.artists().iter().map(|a| unescape_slashes(a)).collect();
            Response::ok_with_data(format!("{} artists", artists.len()), serde_json::json!(artists))
        }

        Request::Albums { artist } => match ipod.artist_by_name(&artist) {
            Some(albums) => {
                let albums: Vec<serde_json::Value> = albums
                    .iter()
                    .map(|(name, list)| {
                        serde_json::json!({
                            "album": unescape_slashes(name),
                            "tracks": list.num_tracks(),
                        })
                    })
                    .collect();
                Response::ok_with_data(format!("{} albums", albums.len()), serde_json::json!(albums))
            }
            None => Response::failure(&Error::DoesNotExist(format!("artist {}", artist))),
        },

        Request::Tracks { artist, album } => {
            let tracks: Vec<&Track> = match (&artist, &album) {
                (Some(artist), Some(album)) => match ipod.album(artist, album) {
                    Some(list) => list.track_ids().filter_map(|id| ipod.track_by_id(id)).collect(),
                    None => {
                        return Response::failure(&Error::DoesNotExist(format!(
                            "album {} / {}",
                            artist, album
                        )))
                    }
                },
                (Some(artist), None) => match ipod.artist_by_name(artist) {
                    Some(albums) => albums
                        .values()
                        .flat_map(|list| list.track_ids())
                        .filter_map(|id| ipod.track_by_id(id))
                        .collect(),
                    None => {
                        return Response::failure(&Error::DoesNotExist(format!("artist {}", artist)))
                    }
                },
                _ => ipod.database().tracks().collect(),
            };
            let data: Vec<serde_json::Value> = tracks.into_iter().map(track_json).collect();
            Response::ok_with_data(format!("{} tracks", data.len()), serde_json::json!(data))
        }

        Request::Playlists => {
            let playlists: Vec<serde_json::Value> = ipod
                .playlist_titles()
                .iter()
                .filter_map(|title| ipod.playlist_by_title(title))
                .map(|list| {
                    serde_json::json!({
                        "title": list.title(),
                        "tracks": list.num_tracks(),
                    })
                })
                .collect();
            Response::ok_with_data(
                format!("{} playlists", playlists.len()),
                serde_json::json!(playlists),
            )
        }

        Request::Playlist { title } => match ipod.playlist_by_title(&title) {
            Some(list) => Response::ok_with_data(
                title.clone(),
                serde_json::json!({
                    "title": list.title(),
                    // deleted entries stay as 0 so positions remain valid
                    "entries": list.entries(),
                }),
            ),
            None => Response::failure(&Error::DoesNotExist(format!("playlist {}", title))),
        },

        Request::CreatePlaylist { title } => Response::from_result(
            ipod.create_playlist(&title),
            format!("Created playlist {}", title),
        ),

        Request::RenamePlaylist { title, new_title } => Response::from_result(
            ipod.rename_playlist(&title, &new_title),
            format!("Renamed playlist {} to {}", title, new_title),
        ),

        Request::DeletePlaylist { title } => Response::from_result(
            ipod.delete_playlist(&title),
            format!("Deleted playlist {}", title),
        ),

        Request::AddToPlaylist { title, track_id } => Response::from_result(
            ipod.add_track_to_playlist(track_id, &title),
            format!("Added track {} to {}", track_id, title),
        ),

        Request::RemoveFromPlaylist { title, position } => Response::from_result(
            ipod.remove_from_playlist(position, &title),
            format!("Removed position {} from {}", position, title),
        ),

        Request::RenameAlbum {
            artist,
            album,
            new_artist,
            new_album,
        } => Response::from_result(
            ipod.rename_album(&artist, &album, &new_artist, &new_album),
            format!("Renamed album to {} / {}", new_artist, new_album),
        ),

        Request::DeleteAlbum { artist, album } => Response::from_result(
            ipod.delete_album(&artist, &album),
            format!("Deleted album {} / {}", artist, album),
        ),

        Request::DeleteArtist { artist } => Response::from_result(
            ipod.delete_artist(&artist),
            format!("Deleted artist {}", artist),
        ),

        Request::DeleteTrack { track_id } => Response::from_result(
            ipod.delete_track(track_id),
            format!("Deleted track {}", track_id),
        ),

        Request::MoveTrack {
            track_id,
            artist,
            album,
        } => Response::from_result(
            ipod.move_track(track_id, &artist, &album),
            format!("Moved track {} to {} / {}", track_id, artist, album),
        ),

        Request::Query { query } => {
            let tracks: Vec<Track> = ipod.database().tracks().cloned().collect();
            let timeout = guard.config.query_timeout;
            // queries run without holding the device
            drop(guard);
            run_query(query, tracks, timeout).await
        }

        Request::RenameDevice { name } => {
            Response::from_result(ipod.set_name(&name), format!("Device renamed to {}", name))
        }

        Request::Write => Response::from_result(ipod.write_itunes_db(), "Database written"),
    }
}

async fn run_query(query: Query, tracks: Vec<Track>, timeout: Duration) -> Response {
    let handle = QueryMaker::from_query(query).spawn(tracks);
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || handle.wait())).await {
        Ok(Ok(Ok(result))) => match serde_json::to_value(&result) {
            Ok(data) => Response::ok_with_data(format!("{} results", result.len()), data),
            Err(e) => Response::error(format!("Failed to encode results: {}", e)),
        },
        Ok(Ok(Err(e))) => Response::failure(&e),
        Ok(Err(e)) => Response::error(format!("Query task failed: {}", e)),
        Err(_) => {
            abort.abort();
            warn!("Query aborted after {:?}", timeout);
            Response {
                success: false,
                code: Some("timeout".to_string()),
                message: Some(format!("Query aborted after {} ms", timeout.as_millis())),
                data: None,
            }
        }
    }
}
