//! Playout runtime driven through its control handle on a real clock

mod helpers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use haze_common::events::{PlaybackState, SinkHealth};
use haze_common::{ControlEvent, PlayoutEvent, TransitionKind};
use haze_playout::audio::{CoverArt, TrackTags};
use haze_playout::playback::{PlayoutEngine, PlayoutHandle, RuntimeOptions};
use haze_playout::sinks::{Backoff, Fanout, SinkSpec};
use haze_playout::SharedState;
use helpers::*;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

struct Running {
    handle: PlayoutHandle,
    events: broadcast::Receiver<PlayoutEvent>,
    task: JoinHandle<()>,
    captured: Captured,
    dir: TempDir,
}

fn options(dir: &Path) -> RuntimeOptions {
    RuntimeOptions {
        block_frames: BLOCK_FRAMES,
        block_duration: Duration::from_millis(5),
        shutdown_timeout: Duration::from_secs(5),
        playlists_dir: dir.join("playlists"),
        now_playing_file: Some(dir.join("now_playing.txt")),
        now_playing_art_file: Some(dir.join("now_playing_art.jpg")),
        autoplay: true,
    }
}

fn start(backend: SyntheticBackend, playlists: Vec<haze_playout::playlist::Playlist>) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(
        backend,
        playlists,
        engine_settings(transitions(TransitionKind::Crossfade, 0.5)),
        controller_settings(true),
    );

    let captured = Captured::default();
    let mut fanout = Fanout::new();
    let c = captured.clone();
    fanout
        .add(
            SinkSpec {
                name: "capture".to_string(),
                kind: "test".to_string(),
                queue_blocks: 256,
                enabled: true,
                factory: Box::new(move || Box::new(CaptureSink(c))),
            },
            Backoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
        )
        .unwrap();

    let state = Arc::new(SharedState::new());
    let events = state.subscribe_events();
    let (runtime, handle) = PlayoutEngine::new(engine, fanout, state, options(dir.path()));
    let task = tokio::spawn(runtime.run());

    Running {
        handle,
        events,
        task,
        captured,
        dir,
    }
}

/// Next broadcast event of the given type, skipping everything else
async fn wait_for(events: &mut broadcast::Receiver<PlayoutEvent>, event_type: &str) -> PlayoutEvent {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if event.event_type() == event_type => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("no {} event within 5s", event_type))
}

async fn wait_for_status(handle: &PlayoutHandle, check: impl Fn(&haze_common::PlayoutStatus) -> bool) {
    for _ in 0..500 {
        if check(&handle.state().get_status().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never matched: {:?}", handle.state().get_status().await);
}

/// Contents of `path` once `check` accepts them
async fn wait_for_file(path: &Path, check: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    for _ in 0..500 {
        if let Ok(bytes) = std::fs::read(path) {
            if check(&bytes) {
                return bytes;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never matched", path.display());
}

async fn stop(running: Running) -> (Captured, TempDir) {
    running.handle.send(ControlEvent::Stop).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running.task)
        .await
        .expect("runtime did not stop")
        .unwrap();
    (running.captured, running.dir)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autoplay_pause_and_stop() {
    let backend = SyntheticBackend::new()
        .with("a", Clip::Tone { frames: 20_000, value: 0.5 })
        .with("b", Clip::Tone { frames: 20_000, value: 0.25 });
    let mut running = start(backend, vec![playlist("Main", &["a", "b"])]);

    match wait_for(&mut running.events, "TrackStarted").await {
        PlayoutEvent::TrackStarted { track, .. } => {
            assert_eq!(track.title, "a");
            assert_eq!(track.playlist, "Main");
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for_status(&running.handle, |s| s.frames_played > 0).await;

    running.handle.send(ControlEvent::Pause).unwrap();
    match wait_for(&mut running.events, "PlaybackStateChanged").await {
        PlayoutEvent::PlaybackStateChanged { state, .. } => assert_eq!(state, PlaybackState::Paused),
        other => panic!("unexpected event {:?}", other),
    }
    wait_for_status(&running.handle, |s| s.state == PlaybackState::Paused).await;

    let status = running.handle.state().get_status().await;
    assert_eq!(status.playlist.as_deref(), Some("Main"));
    assert_eq!(status.current.as_ref().unwrap().title, "a");
    assert_eq!(status.sinks.len(), 1);
    assert_eq!(status.sinks[0].health, SinkHealth::Ok);

    let handle = running.handle.clone();
    let (captured, dir) = stop(running).await;

    // Anything sent after the runtime exits is refused
    assert!(handle.send(ControlEvent::Play).is_err());
    assert_eq!(handle.state().get_playback_state().await, PlaybackState::Stopped);

    let samples = captured.samples();
    assert!(!samples.is_empty());
    assert_eq!(samples.len() % BLOCK_FRAMES, 0);
    assert!(samples.iter().any(|s| approx(*s, 0.5)));
    // Pause decays from the last sample, so nothing exceeds the track level
    assert!(samples.iter().all(|s| (0.0..=0.5 + 1e-4).contains(s)));

    let now_playing = std::fs::read_to_string(dir.path().join("now_playing.txt")).unwrap();
    assert!(now_playing.starts_with("title=a\nartist=\nalbum=\nyear=\nplaylist=Main\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_installs_rescanned_playlists() {
    let backend = SyntheticBackend::new().otherwise(Clip::Tone { frames: 50_000, value: 0.1 });
    let mut running = start(backend, vec![playlist("Main", &["a"])]);
    wait_for(&mut running.events, "TrackStarted").await;

    let root = running.dir.path().join("playlists");
    for path in ["a.wav", "Night/x.wav", "Night/y.wav"] {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();
    }

    running.handle.send(ControlEvent::Reload).unwrap();
    match wait_for(&mut running.events, "PlaylistsReloaded").await {
        PlayoutEvent::PlaylistsReloaded { playlists, .. } => assert_eq!(playlists, 2),
        other => panic!("unexpected event {:?}", other),
    }

    let names: Vec<String> = running
        .handle
        .state()
        .get_playlists()
        .await
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Default", "Night"]);

    running
        .handle
        .send(ControlEvent::SelectPlaylist { name: "Night".to_string() })
        .unwrap();
    match wait_for(&mut running.events, "PlaylistChanged").await {
        PlayoutEvent::PlaylistChanged { name, queued, .. } => {
            assert_eq!(name, "Night");
            assert!(queued);
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for_status(&running.handle, |s| s.pending_playlist.as_deref() == Some("Night")).await;

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_toggle_and_rejected_events() {
    let backend = SyntheticBackend::new().otherwise(Clip::Tone { frames: 50_000, value: 0.1 });
    let mut running = start(backend, vec![playlist("Main", &["a"])]);
    wait_for(&mut running.events, "TrackStarted").await;

    running
        .handle
        .send(ControlEvent::SetSinkEnabled {
            sink: "capture".to_string(),
            enabled: false,
        })
        .unwrap();
    wait_for_status(&running.handle, |s| s.sinks.iter().all(|k| !k.enabled)).await;

    running
        .handle
        .send(ControlEvent::SetSinkEnabled {
            sink: "nowhere".to_string(),
            enabled: true,
        })
        .unwrap();
    match wait_for(&mut running.events, "ControlRejected").await {
        PlayoutEvent::ControlRejected { event, reason, .. } => {
            assert_eq!(event, ControlEvent::SetSinkEnabled { sink: String::new(), enabled: true }.name());
            assert!(reason.contains("nowhere"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    running
        .handle
        .send(ControlEvent::SelectPlaylist { name: "Missing".to_string() })
        .unwrap();
    wait_for(&mut running.events, "ControlRejected").await;

    // Playback carries on regardless
    let before = running.handle.state().get_status().await.frames_played;
    wait_for_status(&running.handle, |s| s.frames_played > before).await;

    stop(running).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_embedded_tags_reach_events_and_now_playing_files() {
    let tags = TrackTags {
        title: Some("Night Drive".to_string()),
        artist: Some("The Lamps".to_string()),
        album: Some("After Hours".to_string()),
        year: Some("1998".to_string()),
        art: Some(CoverArt {
            media_type: "image/jpeg".to_string(),
            data: vec![0xff, 0xd8, 0xff, 0xe0],
        }),
    };
    let backend = SyntheticBackend::new()
        .with("a", Clip::Tone { frames: 20_000, value: 0.5 })
        .tagged("a", tags);
    let mut running = start(backend, vec![playlist("Main", &["a"])]);

    match wait_for(&mut running.events, "TrackStarted").await {
        PlayoutEvent::TrackStarted { track, .. } => {
            assert_eq!(track.title, "Night Drive");
            assert_eq!(track.artist.as_deref(), Some("The Lamps"));
            assert_eq!(track.album.as_deref(), Some("After Hours"));
            assert_eq!(track.year.as_deref(), Some("1998"));
            assert!(track.has_art);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let text = wait_for_file(&running.dir.path().join("now_playing.txt"), |b| !b.is_empty()).await;
    let text = String::from_utf8(text).unwrap();
    assert!(
        text.starts_with("title=Night Drive\nartist=The Lamps\nalbum=After Hours\nyear=1998\nplaylist=Main\n"),
        "{}",
        text
    );
    let art = wait_for_file(&running.dir.path().join("now_playing_art.jpg"), |b| !b.is_empty()).await;
    assert_eq!(art, vec![0xff, 0xd8, 0xff, 0xe0]);

    let status = running.handle.state().get_status().await;
    if let Some(current) = status.current {
        assert_eq!(current.artist.as_deref(), Some("The Lamps"));
    }

    stop(running).await;
}
