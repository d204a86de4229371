use std::collections::HashSet;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_INITIAL_PAGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Exhausted,
}

/// Tracks which posts of a topic's id stream are materialized and hands
/// out the next batch to fetch. One paginator lives per open topic and
/// is discarded when the topic closes.
#[derive(Debug)]
pub struct Paginator {
    stream: Vec<u64>,
    loaded: HashSet<u64>,
    state: LoadState,
    page_size: usize,
}

impl Paginator {
    pub fn new(stream: Vec<u64>, loaded: impl IntoIterator<Item = u64>, page_size: usize) -> Self {
        let loaded: HashSet<u64> = loaded.into_iter().collect();
        let mut paginator = Self {
            stream,
            loaded,
            state: LoadState::Idle,
            page_size: page_size.max(1),
        };
        if !paginator.has_more() {
            paginator.state = LoadState::Exhausted;
        }
        paginator
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn has_more(&self) -> bool {
        self.remaining() > 0
    }

    pub fn remaining(&self) -> usize {
        self.stream
            .iter()
            .filter(|id| !self.loaded.contains(id))
            .count()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn total(&self) -> usize {
        self.stream.len()
    }

    /// Ids not yet materialized, in canonical stream order.
    pub fn missing(&self) -> Vec<u64> {
        self.stream
            .iter()
            .filter(|id| !self.loaded.contains(id))
            .copied()
            .collect()
    }

    /// Starts a load and returns the next page of unfetched ids in
    /// stream order. A trigger while a load is in flight, or after the
    /// stream is exhausted, is a no-op.
    pub fn begin(&mut self) -> Option<Vec<u64>> {
        if self.state != LoadState::Idle {
            return None;
        }
        let batch: Vec<u64> = self
            .stream
            .iter()
            .filter(|id| !self.loaded.contains(id))
            .take(self.page_size)
            .copied()
            .collect();
        if batch.is_empty() {
            self.state = LoadState::Exhausted;
            return None;
        }
        self.state = LoadState::Loading;
        Some(batch)
    }

    /// Finishes a load with the ids that actually arrived. Zero new ids
    /// means the stream is spent and the paginator parks in `Exhausted`
    /// until the topic is reset.
    pub fn complete(&mut self, new_ids: &[u64]) {
        if self.state != LoadState::Loading {
            return;
        }
        let before = self.loaded.len();
        self.loaded.extend(new_ids.iter().copied());
        let grew = self.loaded.len() > before;
        self.state = if grew && self.has_more() {
            LoadState::Idle
        } else {
            LoadState::Exhausted
        };
    }

    /// Abandons an in-flight load without consuming the batch, so a
    /// later trigger can retry the same ids.
    pub fn abort(&mut self) {
        if self.state == LoadState::Loading {
            self.state = LoadState::Idle;
        }
    }

    /// Registers a post that arrived outside the fetch path, e.g. one
    /// the user just authored.
    pub fn push_loaded(&mut self, id: u64) {
        if !self.stream.contains(&id) {
            self.stream.push(id);
        }
        self.loaded.insert(id);
        if self.state == LoadState::Exhausted && self.has_more() {
            self.state = LoadState::Idle;
        }
    }
}
