//! Playout controller: which track plays now and which comes next
//!
//! The controller owns the playlist set, the active playlist, the cursor into
//! its effective order (sequential or a shuffle deck) and a pending playlist
//! switch. It is owned by the mix driver, so it has exactly one writer.
//!
//! The transition engine never sees partial state. It asks for a [`Cue`], a
//! self-contained snapshot naming the playlist, the position in its order
//! and the track, and later hands the cue back through [`commit`] once that
//! track has actually become the program audio.
//!
//! Cues carry the controller generation they were made at. Toggling shuffle,
//! reloading, selecting a playlist or committing bumps the generation; a cue
//! from an older generation is committed by track identity instead of by
//! position.
//!
//! [`commit`]: PlayoutController::commit

use std::sync::Arc;

use haze_common::events::{PlaylistSwitch, TrackInfo};
use haze_common::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::shuffle::ShuffleDeck;
use crate::error::{Error, Result};
use crate::playlist::{Playlist, PlaylistSet, Track};

/// Controller behaviour fixed at startup
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub shuffle: bool,
    pub shuffle_carry_over: usize,
    pub loop_playlist: bool,
    pub playlist_switch: PlaylistSwitch,
    /// Fixed shuffle seed (tests); entropy when unset
    pub seed: Option<u64>,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shuffle: config.playout.shuffle,
            shuffle_carry_over: config.playout.shuffle_carry_over,
            loop_playlist: config.playout.loop_playlist,
            playlist_switch: config.transitions.playlist_switch,
            seed: None,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            shuffle: false,
            shuffle_carry_over: 3,
            loop_playlist: true,
            playlist_switch: PlaylistSwitch::FinishTrack,
            seed: None,
        }
    }
}

/// Snapshot of one playlist entry, valid for the generation it was made at
#[derive(Debug, Clone)]
pub struct Cue {
    pub playlist: Arc<Playlist>,
    /// Position in the playlist's effective order
    pub position: usize,
    /// Index into `playlist.tracks`
    pub index: usize,
    pub track: Arc<Track>,
    /// Committing this cue makes the pending playlist active
    pub switch: bool,
    generation: u64,
}

impl Cue {
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.track.id.clone(),
            title: self.track.display_title(),
            path: self.track.path.display().to_string(),
            playlist: self.playlist.name.clone(),
            index: self.index,
            duration_secs: self.track.duration,
            artist: None,
            album: None,
            year: None,
            has_art: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of selecting a playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The playlist is active now; the caller should cut to its first track
    Immediate,
    /// The playlist takes over at the next natural track boundary
    Queued,
    /// Already active; any queued switch was cancelled
    Unchanged,
}

/// A playlist together with its effective order and cursor
#[derive(Debug, Clone)]
struct Order {
    playlist: Arc<Playlist>,
    deck: Option<ShuffleDeck>,
    pos: usize,
}

impl Order {
    fn new(
        playlist: Arc<Playlist>,
        shuffle: bool,
        carry_over: usize,
        first: Option<usize>,
        rng: &mut StdRng,
    ) -> Self {
        let len = playlist.len();
        let deck = shuffle.then(|| match first {
            Some(index) => ShuffleDeck::starting_with(len, carry_over, index, rng),
            None => ShuffleDeck::new(len, carry_over, rng),
        });
        let pos = match (&deck, first) {
            (None, Some(index)) => index,
            _ => 0,
        };
        Self {
            playlist,
            deck,
            pos,
        }
    }

    fn index_at(&mut self, position: usize, looping: bool, rng: &mut StdRng) -> Option<usize> {
        let len = self.playlist.len();
        if len == 0 || (!looping && position >= len) {
            return None;
        }
        match self.deck.as_mut() {
            Some(deck) => deck.index_at(position, rng),
            None => Some(position % len),
        }
    }

    fn locate(&self, track_id: &str) -> Option<usize> {
        let index = self.playlist.position_of(track_id)?;
        match &self.deck {
            Some(deck) => deck.position_of(index, self.pos),
            None => Some(index),
        }
    }

    fn set_position(&mut self, position: usize, looping: bool) {
        let len = self.playlist.len().max(1);
        self.pos = match self.deck.as_mut() {
            Some(deck) => deck.compact(position),
            None if looping => position % len,
            None => position,
        };
    }
}

/// Owner of the playout position
pub struct PlayoutController {
    set: Arc<PlaylistSet>,
    active: Option<Order>,
    pending: Option<Order>,
    settings: ControllerSettings,
    shuffle: bool,
    generation: u64,
    rng: StdRng,
}

impl PlayoutController {
    pub fn new(set: Arc<PlaylistSet>, settings: ControllerSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            set,
            active: None,
            pending: None,
            shuffle: settings.shuffle,
            settings,
            generation: 0,
            rng,
        }
    }

    /// Activate `preferred` if it exists, else the first playlist
    ///
    /// Returns the name of the playlist made active.
    pub fn activate_default(&mut self, preferred: Option<&str>) -> Option<String> {
        let playlist = preferred
            .and_then(|name| {
                let found = self.set.get(name);
                if found.is_none() {
                    warn!("Default playlist '{}' not found", name);
                }
                found
            })
            .or_else(|| self.set.first())?;
        let name = playlist.name.clone();
        self.activate(playlist, None);
        Some(name)
    }

    fn new_order(&mut self, playlist: Arc<Playlist>, first: Option<usize>) -> Order {
        Order::new(
            playlist,
            self.shuffle,
            self.settings.shuffle_carry_over,
            first,
            &mut self.rng,
        )
    }

    fn activate(&mut self, playlist: Arc<Playlist>, first: Option<usize>) {
        info!("Activating playlist '{}' ({} tracks)", playlist.name, playlist.len());
        let order = self.new_order(playlist, first);
        self.active = Some(order);
        self.pending = None;
        self.generation += 1;
    }

    pub fn playlists(&self) -> &Arc<PlaylistSet> {
        &self.set
    }

    pub fn active_playlist(&self) -> Option<&Arc<Playlist>> {
        self.active.as_ref().map(|o| &o.playlist)
    }

    pub fn pending_playlist(&self) -> Option<&Arc<Playlist>> {
        self.pending.as_ref().map(|o| &o.playlist)
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn loop_playlist(&self) -> bool {
        self.settings.loop_playlist
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn cue_from(&mut self, from_pending: bool, position: usize) -> Option<Cue> {
        let looping = self.settings.loop_playlist;
        let generation = self.generation;
        let order = if from_pending {
            self.pending.as_mut()?
        } else {
            self.active.as_mut()?
        };
        let index = order.index_at(position, looping, &mut self.rng)?;
        let track = Arc::clone(order.playlist.tracks.get(index)?);
        Some(Cue {
            playlist: Arc::clone(&order.playlist),
            position,
            index,
            track,
            switch: from_pending,
            generation,
        })
    }

    /// The entry at the cursor
    pub fn current(&mut self) -> Option<Cue> {
        let pos = self.active.as_ref()?.pos;
        self.cue_from(false, pos)
    }

    /// The entry `skip` places after the next one
    ///
    /// A queued playlist switch takes effect here: the next entry is the
    /// first of the pending playlist. `None` past the end of a non-looping
    /// playlist.
    pub fn upcoming(&mut self, skip: usize) -> Option<Cue> {
        if self.pending.is_some() {
            return self.cue_from(true, skip);
        }
        let pos = self.active.as_ref()?.pos;
        self.cue_from(false, pos + 1 + skip)
    }

    /// The entry following `cue` (used when `cue` failed to decode)
    pub fn upcoming_after(&mut self, cue: &Cue) -> Option<Cue> {
        if cue.generation != self.generation {
            return self.upcoming(0);
        }
        self.cue_from(cue.switch, cue.position + 1)
    }

    /// The entry before the cursor
    ///
    /// Sequential order wraps to the last track when looping; shuffle order
    /// stops at the start of the current deck.
    pub fn previous(&mut self) -> Option<Cue> {
        let order = self.active.as_ref()?;
        let len = order.playlist.len();
        if len == 0 {
            return None;
        }
        let position = match (&order.deck, order.pos) {
            (None, 0) if self.settings.loop_playlist => len - 1,
            (_, pos) => pos.saturating_sub(1),
        };
        self.cue_from(false, position)
    }

    /// Record that `cue` is now the program audio
    pub fn commit(&mut self, cue: &Cue) {
        let looping = self.settings.loop_playlist;

        if cue.generation == self.generation {
            if cue.switch {
                if let Some(pending) = self.pending.take() {
                    info!("Switched to playlist '{}'", pending.playlist.name);
                    self.active = Some(pending);
                }
            }
            if let Some(order) = self.active.as_mut() {
                order.set_position(cue.position, looping);
            }
        } else {
            self.reconcile(cue);
        }

        self.generation += 1;
    }

    /// Commit a cue made before the last change, by playlist name and track identity
    fn reconcile(&mut self, cue: &Cue) {
        let name = &cue.playlist.name;
        let pending_matches = self
            .pending
            .as_ref()
            .is_some_and(|p| &p.playlist.name == name);
        let active_matches = self
            .active
            .as_ref()
            .is_some_and(|a| &a.playlist.name == name);

        if cue.switch && pending_matches {
            self.active = self.pending.take();
        } else if !active_matches {
            match self.set.get(name) {
                Some(playlist) => {
                    let order = self.new_order(playlist, None);
                    self.active = Some(order);
                }
                None => {
                    debug!("Committed track from vanished playlist '{}'", name);
                    return;
                }
            }
        }

        let looping = self.settings.loop_playlist;
        if let Some(order) = self.active.as_mut() {
            match order.locate(&cue.track.id) {
                Some(position) => order.set_position(position, looping),
                None => debug!("Track {} no longer in '{}'", cue.track.id, name),
            }
        }
    }

    /// Move the cursor back to the start of the active playlist
    pub fn restart(&mut self) {
        if let Some(order) = self.active.take() {
            let fresh = self.new_order(order.playlist, None);
            self.active = Some(fresh);
        }
        self.generation += 1;
    }

    /// Step the cursor forward one entry; returns the new current entry
    pub fn advance(&mut self) -> Option<Cue> {
        let next = self.upcoming(0)?;
        self.commit(&next);
        Some(next)
    }

    /// Step the cursor back one entry; returns the new current entry
    pub fn retreat(&mut self) -> Option<Cue> {
        let prev = self.previous()?;
        self.commit(&prev);
        Some(prev)
    }

    /// Select a playlist by name
    ///
    /// With `finish_track` switching and something playing, the switch is
    /// queued; otherwise it applies now.
    pub fn select_playlist(&mut self, name: &str, playing: bool) -> Result<SelectOutcome> {
        let playlist = self
            .set
            .get(name)
            .ok_or_else(|| Error::Playlist(format!("unknown playlist '{}'", name)))?;
        if playlist.is_empty() {
            return Err(Error::Playlist(format!("playlist '{}' is empty", name)));
        }

        if self.active_playlist().is_some_and(|a| a.name == name) {
            if self.pending.take().is_some() {
                self.generation += 1;
                info!("Cancelled queued playlist switch, staying on '{}'", name);
            }
            return Ok(SelectOutcome::Unchanged);
        }

        if !playing || self.settings.playlist_switch == PlaylistSwitch::Immediate {
            self.activate(playlist, None);
            return Ok(SelectOutcome::Immediate);
        }

        info!("Queued switch to playlist '{}'", name);
        let order = self.new_order(playlist, None);
        self.pending = Some(order);
        self.generation += 1;
        Ok(SelectOutcome::Queued)
    }

    /// Turn shuffle on or off, regenerating the order after the current entry
    pub fn set_shuffle(&mut self, enabled: bool) {
        if self.shuffle == enabled {
            return;
        }
        self.shuffle = enabled;
        info!("Shuffle {}", if enabled { "enabled" } else { "disabled" });

        if let Some(order) = self.active.take() {
            let current = {
                let mut order = order.clone();
                order.index_at(order.pos, true, &mut self.rng)
            };
            let rebuilt = self.new_order(Arc::clone(&order.playlist), current);
            self.active = Some(rebuilt);
        }
        if let Some(pending) = self.pending.take() {
            let rebuilt = self.new_order(pending.playlist, None);
            self.pending = Some(rebuilt);
        }
        self.generation += 1;
    }

    /// Install a freshly discovered playlist set
    ///
    /// The active playlist is kept by name and the cursor re-found by track
    /// identity, falling back to its first track. If the active playlist
    /// vanished, the first playlist of the new set becomes active.
    pub fn reload(&mut self, set: Arc<PlaylistSet>) {
        let current_id = self.current().map(|cue| cue.track.id.clone());
        let active_name = self.active_playlist().map(|p| p.name.clone());
        let pending_name = self.pending_playlist().map(|p| p.name.clone());
        self.set = set;

        self.active = None;
        let playlist = active_name
            .as_deref()
            .and_then(|name| self.set.get(name))
            .filter(|p| !p.is_empty());
        match playlist {
            Some(playlist) => {
                // A vanished track resumes at index 0, whatever the shuffle deck says
                let first = current_id
                    .as_deref()
                    .and_then(|id| playlist.position_of(id))
                    .unwrap_or(0);
                let order = self.new_order(playlist, Some(first));
                self.active = Some(order);
            }
            None => {
                if let Some(name) = &active_name {
                    warn!("Active playlist '{}' disappeared on reload", name);
                }
                if let Some(first) = self.set.first() {
                    let order = self.new_order(first, None);
                    self.active = Some(order);
                }
            }
        }

        self.pending = pending_name
            .as_deref()
            .and_then(|name| self.set.get(name))
            .filter(|p| !p.is_empty())
            .map(|p| self.new_order(p, None));

        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn playlist(name: &str, n: usize) -> Playlist {
        Playlist::new(
            name,
            (0..n)
                .map(|i| Track::new(format!("/haze-test/{name}/{i:02}.mp3")))
                .collect(),
        )
    }

    fn controller(settings: ControllerSettings) -> PlayoutController {
        let set = PlaylistSet::new(vec![playlist("A", 4), playlist("B", 3)]);
        let mut ctl = PlayoutController::new(Arc::new(set), settings);
        ctl.activate_default(None);
        ctl
    }

    fn sequential() -> PlayoutController {
        controller(ControllerSettings::default())
    }

    #[test]
    fn test_sequential_advance_wraps() {
        let mut ctl = sequential();
        assert_eq!(ctl.current().unwrap().index, 0);
        let indices: Vec<usize> = (0..5).map(|_| ctl.advance().unwrap().index).collect();
        assert_eq!(indices, vec![1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_upcoming_does_not_move_cursor() {
        let mut ctl = sequential();
        assert_eq!(ctl.upcoming(0).unwrap().index, 1);
        assert_eq!(ctl.upcoming(2).unwrap().index, 3);
        assert_eq!(ctl.current().unwrap().index, 0);
    }

    #[test]
    fn test_non_looping_playlist_ends() {
        let mut ctl = controller(ControllerSettings {
            loop_playlist: false,
            ..Default::default()
        });
        for _ in 0..3 {
            ctl.advance().unwrap();
        }
        assert_eq!(ctl.current().unwrap().index, 3);
        assert!(ctl.upcoming(0).is_none());
        assert!(ctl.advance().is_none());
    }

    #[test]
    fn test_retreat() {
        let mut ctl = sequential();
        ctl.advance();
        ctl.advance();
        assert_eq!(ctl.retreat().unwrap().index, 1);
        assert_eq!(ctl.retreat().unwrap().index, 0);
        // Sequential order wraps backwards when looping
        assert_eq!(ctl.retreat().unwrap().index, 3);
    }

    #[test]
    fn test_queued_switch_takes_effect_at_commit() {
        let mut ctl = sequential();
        assert_eq!(ctl.select_playlist("B", true).unwrap(), SelectOutcome::Queued);
        assert_eq!(ctl.active_playlist().unwrap().name, "A");

        let next = ctl.upcoming(0).unwrap();
        assert!(next.switch);
        assert_eq!(next.playlist.name, "B");
        assert_eq!(next.index, 0);

        ctl.commit(&next);
        assert_eq!(ctl.active_playlist().unwrap().name, "B");
        assert!(ctl.pending_playlist().is_none());
        assert_eq!(ctl.upcoming(0).unwrap().index, 1);
    }

    #[test]
    fn test_switch_is_immediate_when_idle_or_configured() {
        let mut ctl = sequential();
        assert_eq!(ctl.select_playlist("B", false).unwrap(), SelectOutcome::Immediate);
        assert_eq!(ctl.active_playlist().unwrap().name, "B");

        let mut ctl = controller(ControllerSettings {
            playlist_switch: PlaylistSwitch::Immediate,
            ..Default::default()
        });
        assert_eq!(ctl.select_playlist("B", true).unwrap(), SelectOutcome::Immediate);
        assert_eq!(ctl.current().unwrap().playlist.name, "B");
    }

    #[test]
    fn test_select_unknown_or_same_playlist() {
        let mut ctl = sequential();
        assert!(ctl.select_playlist("Nope", true).is_err());
        ctl.select_playlist("B", true).unwrap();
        assert_eq!(ctl.select_playlist("A", true).unwrap(), SelectOutcome::Unchanged);
        assert!(ctl.pending_playlist().is_none());
    }

    #[test]
    fn test_stale_cue_commits_by_identity() {
        let mut ctl = controller(ControllerSettings {
            seed: Some(11),
            ..Default::default()
        });
        let next = ctl.upcoming(0).unwrap();
        assert_eq!(next.index, 1);

        ctl.set_shuffle(true);
        assert_ne!(next.generation(), ctl.generation());

        ctl.commit(&next);
        assert_eq!(ctl.current().unwrap().track.id, next.track.id);
    }

    #[test]
    fn test_shuffle_keeps_current_and_covers_playlist() {
        let mut ctl = controller(ControllerSettings {
            seed: Some(5),
            ..Default::default()
        });
        ctl.advance();
        let playing = ctl.current().unwrap().track.id.clone();

        ctl.set_shuffle(true);
        assert!(ctl.shuffle());
        assert_eq!(ctl.current().unwrap().track.id, playing);

        let mut seen = HashSet::new();
        seen.insert(ctl.current().unwrap().index);
        for _ in 0..3 {
            seen.insert(ctl.advance().unwrap().index);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_failed_cue_skips_forward() {
        let mut ctl = sequential();
        let first = ctl.upcoming(0).unwrap();
        let second = ctl.upcoming_after(&first).unwrap();
        let third = ctl.upcoming_after(&second).unwrap();
        assert_eq!((first.index, second.index, third.index), (1, 2, 3));
    }

    #[test]
    fn test_reload_keeps_track_by_identity() {
        let mut ctl = sequential();
        ctl.advance();
        ctl.advance();
        let playing = ctl.current().unwrap().track.id.clone();

        // New set: A gained a track at the front
        let mut a = playlist("A", 4);
        a.tracks.insert(0, Arc::new(Track::new("/haze-test/A/new.mp3")));
        ctl.reload(Arc::new(PlaylistSet::new(vec![a, playlist("B", 3)])));

        let cue = ctl.current().unwrap();
        assert_eq!(cue.track.id, playing);
        assert_eq!(cue.index, 3);
    }

    #[test]
    fn test_reload_resumes_at_first_track_when_current_vanishes() {
        for seed in 0..8 {
            let mut ctl = controller(ControllerSettings {
                shuffle: true,
                seed: Some(seed),
                ..Default::default()
            });
            ctl.advance();
            let playing = ctl.current().unwrap().track.id.clone();

            let mut a = playlist("A", 4);
            a.tracks.retain(|t| t.id != playing);
            let first = a.tracks[0].id.clone();
            ctl.reload(Arc::new(PlaylistSet::new(vec![a, playlist("B", 3)])));

            let cue = ctl.current().unwrap();
            assert_eq!(cue.index, 0, "seed {}", seed);
            assert_eq!(cue.track.id, first, "seed {}", seed);
            assert!(ctl.shuffle());
        }
    }

    #[test]
    fn test_reload_falls_back_when_playlist_vanishes() {
        let mut ctl = sequential();
        ctl.select_playlist("B", true).unwrap();
        ctl.reload(Arc::new(PlaylistSet::new(vec![playlist("C", 2)])));
        assert_eq!(ctl.active_playlist().unwrap().name, "C");
        assert!(ctl.pending_playlist().is_none());
        assert_eq!(ctl.current().unwrap().index, 0);
    }

    #[test]
    fn test_empty_set_has_no_cues() {
        let mut ctl = PlayoutController::new(Arc::new(PlaylistSet::default()), Default::default());
        assert!(ctl.activate_default(Some("A")).is_none());
        assert!(ctl.current().is_none());
        assert!(ctl.upcoming(0).is_none());
        assert!(ctl.previous().is_none());
    }
}
