//! Virtualized console window: turns the filtered buffer into the
//! minimal set of visible rows for a pixel viewport. Layout is a prefix
//! sum over row heights, rebuilt only when the buffer version or the
//! filter changes; the visible range is two binary searches per frame.

use crate::store::ConsoleSnapshot;
use shared::{ConsoleRecord, LogLevel, BOTTOM_PIN_THRESHOLD_PX};

/// Whether the window follows new output or holds a scrollback position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    /// Anchored to the newest row; appends keep the bottom in view.
    Pinned,
    /// Holding a user-chosen scroll offset; appends do not move it.
    Free,
}

/// Predicate applied to the buffer before layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleFilter {
    pub min_level: LogLevel,
    /// Case-insensitive substring match on the line text.
    pub query: Option<String>,
}

impl Default for ConsoleFilter {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            query: None,
        }
    }
}

impl ConsoleFilter {
    fn matches(&self, record: &ConsoleRecord) -> bool {
        if record.level < self.min_level {
            return false;
        }
        match &self.query {
            Some(query) => record
                .text
                .to_lowercase()
                .contains(&query.to_lowercase()),
            None => true,
        }
    }
}

/// One row the caller should draw this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    /// Position within the filtered sequence.
    pub index: usize,
    /// Stable render key; survives eviction and filtering.
    pub seq: u64,
    /// Pixel offset of the row top within the full virtual document.
    pub offset: f32,
    pub height: f32,
    pub record: ConsoleRecord,
}

/// Per-view window state. Holds no buffer data of its own; each frame it
/// reads the snapshot the store hands it.
pub struct ConsoleWindow {
    measure: Box<dyn Fn(&ConsoleRecord) -> f32 + Send>,
    filter: ConsoleFilter,
    filter_generation: u64,
    mode: ScrollMode,
    scroll_top: f32,
    viewport_px: f32,
    overscan: usize,

    // Layout cache, valid for one (buffer version, filter generation).
    built_for: Option<(u64, u64)>,
    filtered: Vec<(usize, u64)>,
    offsets: Vec<f32>,
}

impl ConsoleWindow {
    pub fn new(measure: impl Fn(&ConsoleRecord) -> f32 + Send + 'static) -> Self {
        Self {
            measure: Box::new(measure),
            filter: ConsoleFilter::default(),
            filter_generation: 0,
            mode: ScrollMode::Pinned,
            scroll_top: 0.0,
            viewport_px: 0.0,
            overscan: 2,
            built_for: None,
            filtered: Vec::new(),
            offsets: vec![0.0],
        }
    }

    /// Uniform row height, for views without line wrapping.
    pub fn with_fixed_height(height_px: f32) -> Self {
        Self::new(move |_| height_px)
    }

    pub fn set_filter(&mut self, filter: ConsoleFilter) {
        if filter != self.filter {
            self.filter = filter;
            self.filter_generation += 1;
        }
    }

    pub fn set_viewport(&mut self, viewport_px: f32) {
        self.viewport_px = viewport_px.max(0.0);
    }

    pub fn set_overscan(&mut self, rows: usize) {
        self.overscan = rows;
    }

    /// Applies a user scroll. The window drops to Free immediately; the
    /// next `visible_rows` call re-enters Pinned when the offset landed
    /// within the pin threshold of the bottom edge.
    pub fn set_scroll_top(&mut self, px: f32) {
        self.scroll_top = px.max(0.0);
        self.mode = ScrollMode::Free;
    }

    pub fn pin_to_bottom(&mut self) {
        self.mode = ScrollMode::Pinned;
    }

    pub fn mode(&self) -> ScrollMode {
        self.mode
    }

    pub fn scroll_top(&self) -> f32 {
        self.scroll_top
    }

    /// Total height of the filtered virtual document as of the last
    /// `visible_rows` call.
    pub fn total_height(&self) -> f32 {
        *self.offsets.last().unwrap_or(&0.0)
    }

    /// Computes the rows intersecting the viewport, plus overscan on
    /// both sides. Cost is O(changed rows) when the layout needs a
    /// rebuild and O(log n + visible) otherwise.
    pub fn visible_rows(&mut self, snapshot: &ConsoleSnapshot) -> Vec<WindowRow> {
        self.ensure_layout(snapshot);

        if self.filtered.is_empty() {
            return Vec::new();
        }

        let total = self.total_height();
        let max_top = (total - self.viewport_px).max(0.0);

        match self.mode {
            ScrollMode::Pinned => self.scroll_top = max_top,
            ScrollMode::Free => {
                self.scroll_top = self.scroll_top.min(max_top);
                if max_top - self.scroll_top <= BOTTOM_PIN_THRESHOLD_PX {
                    self.mode = ScrollMode::Pinned;
                    self.scroll_top = max_top;
                }
            }
        }

        let top = self.scroll_top;
        let bottom = top + self.viewport_px;

        // First row whose bottom edge is below the viewport top, last
        // row whose top edge is above the viewport bottom.
        let first = self
            .offsets
            .partition_point(|&offset| offset <= top)
            .saturating_sub(1);
        let last = self
            .offsets
            .partition_point(|&offset| offset < bottom)
            .min(self.filtered.len());

        let start = first.saturating_sub(self.overscan);
        let end = (last + self.overscan).min(self.filtered.len());
        // A visible viewport over a non-empty document always yields at
        // least one row, even with a zero-height viewport.
        let end = end.max(start + 1).min(self.filtered.len());

        (start..end)
            .map(|i| {
                let (entry_index, seq) = self.filtered[i];
                WindowRow {
                    index: i,
                    seq,
                    offset: self.offsets[i],
                    height: self.offsets[i + 1] - self.offsets[i],
                    record: snapshot.entries[entry_index].record.clone(),
                }
            })
            .collect()
    }

    fn ensure_layout(&mut self, snapshot: &ConsoleSnapshot) {
        let key = (snapshot.version, self.filter_generation);
        if self.built_for == Some(key) {
            return;
        }

        self.filtered.clear();
        self.offsets.clear();
        self.offsets.push(0.0);

        let mut running = 0.0;
        for (entry_index, entry) in snapshot.entries.iter().enumerate() {
            if !self.filter.matches(&entry.record) {
                continue;
            }
            running += (self.measure)(&entry.record);
            self.filtered.push((entry_index, entry.seq));
            self.offsets.push(running);
        }

        self.built_for = Some(key);
    }
}
