use std::sync::Arc;

use crate::discourse::{self, FetchError, Post, PostBatches, TopicResponse};

/// Seam between the session layer and the network. The real
/// implementation is `discourse::Client`; tests swap in `MockFetcher`.
pub trait TopicFetcher: Send + Sync {
    fn fetch_topic(&self, url: &str) -> Result<TopicResponse, FetchError>;
    fn fetch_posts(&self, topic_id: u64, post_ids: &[u64]) -> PostBatches;
    fn batch_size(&self) -> usize {
        discourse::DEFAULT_BATCH_SIZE
    }
}

pub trait InteractionService: Send + Sync {
    fn like_post(&self, post_id: u64) -> Result<(), FetchError>;
    fn unlike_post(&self, post_id: u64) -> Result<(), FetchError>;
    fn bookmark_topic(&self, topic_id: u64) -> Result<(), FetchError>;
    fn unbookmark_topic(&self, topic_id: u64) -> Result<(), FetchError>;
}

impl TopicFetcher for discourse::Client {
    fn fetch_topic(&self, url: &str) -> Result<TopicResponse, FetchError> {
        discourse::Client::fetch_topic(self, url)
    }

    fn fetch_posts(&self, topic_id: u64, post_ids: &[u64]) -> PostBatches {
        discourse::Client::fetch_posts(self, topic_id, post_ids)
    }

    fn batch_size(&self) -> usize {
        discourse::Client::batch_size(self)
    }
}

impl InteractionService for discourse::Client {
    fn like_post(&self, post_id: u64) -> Result<(), FetchError> {
        discourse::Client::like_post(self, post_id)
    }

    fn unlike_post(&self, post_id: u64) -> Result<(), FetchError> {
        discourse::Client::unlike_post(self, post_id)
    }

    fn bookmark_topic(&self, topic_id: u64) -> Result<(), FetchError> {
        discourse::Client::bookmark_topic(self, topic_id)
    }

    fn unbookmark_topic(&self, topic_id: u64) -> Result<(), FetchError> {
        discourse::Client::unbookmark_topic(self, topic_id)
    }
}

/// Fetches every post of the stream that `known` does not yet cover,
/// batch by batch, and returns the merged list sorted by sequence
/// number. Failed batches are skipped; `progress` fires after each
/// successful one with a "loaded X of Y" status line.
pub fn fetch_remaining(
    fetcher: &dyn TopicFetcher,
    topic_id: u64,
    stream: &[u64],
    known: Vec<Post>,
    progress: &mut dyn FnMut(&str),
) -> (Vec<Post>, usize) {
    let total = stream.len();
    let loaded: std::collections::HashSet<u64> = known.iter().map(|post| post.id).collect();
    let missing: Vec<u64> = stream
        .iter()
        .filter(|id| !loaded.contains(id))
        .copied()
        .collect();

    let mut posts = known;
    let mut failed = 0;
    for chunk in missing.chunks(fetcher.batch_size()) {
        let batch = fetcher.fetch_posts(topic_id, chunk);
        failed += batch.failed_batches;
        if !batch.posts.is_empty() {
            posts.extend(batch.posts);
            progress(&format!("loaded {} of {}", posts.len(), total));
        }
    }
    posts.sort_by_key(|post| post.post_number);
    (posts, failed)
}

#[derive(Default)]
pub struct MockFetcher {
    pub topic: Option<TopicResponse>,
    pub posts: Vec<Post>,
    /// Ids whose batches the mock pretends failed on the wire.
    pub failing_ids: std::collections::HashSet<u64>,
    pub batch_size: usize,
    pub fetch_calls: std::sync::atomic::AtomicUsize,
}

impl MockFetcher {
    pub fn new(topic: TopicResponse, posts: Vec<Post>) -> Self {
        Self {
            topic: Some(topic),
            posts,
            failing_ids: Default::default(),
            batch_size: discourse::DEFAULT_BATCH_SIZE,
            fetch_calls: Default::default(),
        }
    }
}

impl TopicFetcher for MockFetcher {
    fn fetch_topic(&self, _url: &str) -> Result<TopicResponse, FetchError> {
        self.topic.clone().ok_or(FetchError::NotFound)
    }

    fn fetch_posts(&self, _topic_id: u64, post_ids: &[u64]) -> PostBatches {
        self.fetch_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut out = PostBatches::default();
        for chunk in post_ids.chunks(self.batch_size.max(1)) {
            out.total_batches += 1;
            if chunk.iter().any(|id| self.failing_ids.contains(id)) {
                out.failed_batches += 1;
                continue;
            }
            out.posts.extend(
                self.posts
                    .iter()
                    .filter(|post| chunk.contains(&post.id))
                    .cloned(),
            );
        }
        out
    }

    fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Default)]
pub struct MockInteractionService;

impl InteractionService for MockInteractionService {
    fn like_post(&self, _post_id: u64) -> Result<(), FetchError> {
        Ok(())
    }

    fn unlike_post(&self, _post_id: u64) -> Result<(), FetchError> {
        Ok(())
    }

    fn bookmark_topic(&self, _topic_id: u64) -> Result<(), FetchError> {
        Ok(())
    }

    fn unbookmark_topic(&self, _topic_id: u64) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Convenience for holding either the real client or a mock.
pub type SharedFetcher = Arc<dyn TopicFetcher>;
