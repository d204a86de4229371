use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TopicCache;
use crate::data::{self, TopicFetcher};
use crate::discourse::{self, FetchError, Post, Topic};
use crate::pagination::{LoadState, Paginator, DEFAULT_INITIAL_PAGES, DEFAULT_PAGE_SIZE};
use crate::tree::{self, TopicTree};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_size: usize,
    pub initial_pages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: DEFAULT_INITIAL_PAGES,
        }
    }
}

/// What the renderer gets when a topic opens or is rebuilt: the topic
/// summary, the assembled tree, and whether more posts remain.
#[derive(Debug, Clone)]
pub struct TopicView {
    pub topic: Topic,
    pub tree: TopicTree,
    pub has_more: bool,
}

struct OpenTopic {
    topic: Topic,
    posts: Vec<Post>,
    paginator: Paginator,
}

/// Per-view context for one open topic: wires the cache, the fetcher
/// and the paginator together. Exactly one topic is open at a time;
/// opening another (or closing) discards the previous state, so a
/// stale in-flight result can never advance a discarded paginator.
pub struct TopicSession {
    fetcher: Arc<dyn TopicFetcher>,
    cache: Arc<Mutex<TopicCache>>,
    cfg: SessionConfig,
    current: Option<OpenTopic>,
}

impl TopicSession {
    pub fn new(
        fetcher: Arc<dyn TopicFetcher>,
        cache: Arc<Mutex<TopicCache>>,
        cfg: SessionConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            cfg,
            current: None,
        }
    }

    /// Opens a topic by URL. A fresh cache entry short-circuits the
    /// network entirely; otherwise the topic summary is fetched, the
    /// first `initial_pages` worth of posts are prefetched by id, and
    /// the result is cached for the next open.
    pub fn open(&mut self, url: &str) -> Result<TopicView, FetchError> {
        self.close();

        if let Some(topic_id) = discourse::extract_topic_id(url) {
            let cached = self
                .cache
                .lock()
                .get(topic_id)
                .map(|entry| (entry.topic.clone(), entry.posts.clone()));
            if let Some((topic, posts)) = cached {
                return Ok(self.install(topic, posts));
            }
        }

        let resp = self.fetcher.fetch_topic(url)?;
        let topic = resp.topic();
        let mut posts = resp.post_stream.posts;

        let loaded: HashSet<u64> = posts.iter().map(|post| post.id).collect();
        let budget = self.cfg.initial_pages * self.cfg.page_size;
        let prefetch: Vec<u64> = topic
            .stream
            .iter()
            .filter(|id| !loaded.contains(id))
            .take(budget)
            .copied()
            .collect();
        if !prefetch.is_empty() {
            let fetched = self.fetcher.fetch_posts(topic.id, &prefetch);
            if let Some(err) = fetched.partial_failure() {
                log::warn!("topic {}: prefetch incomplete: {}", topic.id, err);
            }
            posts.extend(fetched.posts);
        }
        posts.sort_by_key(|post| post.post_number);

        self.cache.lock().put(topic.id, topic.clone(), posts.clone());
        Ok(self.install(topic, posts))
    }

    fn install(&mut self, topic: Topic, posts: Vec<Post>) -> TopicView {
        let paginator = Paginator::new(
            topic.stream.clone(),
            posts.iter().map(|post| post.id),
            self.cfg.page_size,
        );
        let has_more = paginator.has_more();
        let tree = tree::build(posts.clone());
        self.current = Some(OpenTopic {
            topic: topic.clone(),
            posts,
            paginator,
        });
        TopicView {
            topic,
            tree,
            has_more,
        }
    }

    /// Loads the next page of posts when a proximity trigger fires.
    /// Returns the new posts FLAT: they have not been run through the
    /// tree builder and belong at the root level until the caller asks
    /// for `rebuild_tree`. A trigger while a load is in flight, after
    /// exhaustion, or with no open topic returns an empty list.
    pub fn load_more(&mut self) -> Result<Vec<Post>, FetchError> {
        let open = match self.current.as_mut() {
            Some(open) => open,
            None => return Ok(Vec::new()),
        };
        let batch = match open.paginator.begin() {
            Some(batch) => batch,
            None => return Ok(Vec::new()),
        };

        let fetched = self.fetcher.fetch_posts(open.topic.id, &batch);
        if fetched.all_failed() {
            // Nothing arrived at all; release the guard so the next
            // trigger retries the same ids.
            open.paginator.abort();
            return Err(FetchError::PartialBatch {
                failed: fetched.failed_batches,
                total: fetched.total_batches,
            });
        }
        if let Some(err) = fetched.partial_failure() {
            log::warn!("topic {}: {}", open.topic.id, err);
        }

        let new_ids: Vec<u64> = fetched.posts.iter().map(|post| post.id).collect();
        open.paginator.complete(&new_ids);
        open.posts.extend(fetched.posts.iter().cloned());
        open.posts.sort_by_key(|post| post.post_number);
        Ok(fetched.posts)
    }

    /// Fetches every remaining post and rebuilds the full tree,
    /// reporting "loaded X of Y" after each batch. The refreshed post
    /// set replaces the cache entry.
    pub fn load_all(&mut self, progress: &mut dyn FnMut(&str)) -> Result<TopicView, FetchError> {
        let (topic, known) = match self.current.as_ref() {
            Some(open) => (open.topic.clone(), open.posts.clone()),
            None => return Err(FetchError::NotFound),
        };
        let (posts, failed) = data::fetch_remaining(
            self.fetcher.as_ref(),
            topic.id,
            &topic.stream,
            known,
            progress,
        );
        if failed > 0 {
            log::warn!("topic {}: {} batches failed during full load", topic.id, failed);
        }
        self.cache.lock().put(topic.id, topic.clone(), posts.clone());
        Ok(self.install(topic, posts))
    }

    /// Re-runs the tree builder over the full accumulated post set, for
    /// callers that want pagination results merged parent-aware.
    pub fn rebuild_tree(&self) -> TopicTree {
        match self.current.as_ref() {
            Some(open) => tree::build(open.posts.clone()),
            None => TopicTree::default(),
        }
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.current.as_ref().map(|open| &open.topic)
    }

    pub fn has_more(&self) -> bool {
        self.current
            .as_ref()
            .map(|open| open.paginator.has_more())
            .unwrap_or(false)
    }

    pub fn load_state(&self) -> Option<LoadState> {
        self.current.as_ref().map(|open| open.paginator.state())
    }

    pub fn remaining(&self) -> usize {
        self.current
            .as_ref()
            .map(|open| open.paginator.remaining())
            .unwrap_or(0)
    }

    /// Authoring side-channel: the caller tells the session a post was
    /// just created in a topic. The cache entry is invalidated so the
    /// next open refetches; when the topic is the open one and the new
    /// post is supplied, it is appended locally so the view can show it
    /// without a round trip.
    pub fn content_authored(&mut self, topic_id: u64, post: Option<Post>) {
        self.cache.lock().invalidate(topic_id);
        let open = match self.current.as_mut() {
            Some(open) if open.topic.id == topic_id => open,
            _ => return,
        };
        if let Some(post) = post {
            open.topic.posts_count += 1;
            if !open.topic.stream.contains(&post.id) {
                open.topic.stream.push(post.id);
            }
            open.paginator.push_loaded(post.id);
            open.posts.push(post);
        }
    }

    /// Optimistic like-count adjustment after a like/unlike call. Local
    /// mutation of cached state is paired with invalidation because the
    /// cache has no update-in-place.
    pub fn apply_topic_like(&mut self, delta: i64) {
        if let Some(open) = self.current.as_mut() {
            open.topic.like_count = (open.topic.like_count + delta).max(0);
            self.cache.lock().invalidate(open.topic.id);
        }
    }

    pub fn set_bookmarked(&mut self, bookmarked: bool) {
        if let Some(open) = self.current.as_mut() {
            open.topic.bookmarked = bookmarked;
            self.cache.lock().invalidate(open.topic.id);
        }
    }

    /// Discards per-topic state. Results of requests already in flight
    /// are simply ignored afterwards; nothing can mutate a paginator
    /// that no longer exists.
    pub fn close(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use crate::data::MockFetcher;
    use crate::discourse::{PostStream, TopicResponse};
    use chrono::Utc;
    use std::time::Duration;

    fn post(id: u64, number: u32, reply_to: Option<u32>) -> Post {
        Post {
            id,
            post_number: number,
            username: format!("user{number}"),
            display_username: String::new(),
            created_at: Utc::now(),
            cooked: format!("<p>{number}</p>"),
            reply_to_post_number: reply_to,
            actions_summary: Vec::new(),
            topic_id: 7,
            avatar_template: String::new(),
        }
    }

    /// 50 posts, ids 101..=150, server sends the first 20 inline.
    fn fixture() -> (TopicResponse, Vec<Post>) {
        let all: Vec<Post> = (1..=50)
            .map(|n| post(n as u64 + 100, n, None))
            .collect();
        let stream: Vec<u64> = all.iter().map(|p| p.id).collect();
        let inline: Vec<Post> = all[..20].to_vec();
        let resp = TopicResponse {
            id: 7,
            title: "fixture".into(),
            posts_count: 50,
            like_count: 3,
            bookmarked: Some(false),
            category_id: None,
            slug: "fixture".into(),
            post_stream: PostStream {
                stream,
                posts: inline,
            },
        };
        (resp, all)
    }

    fn session(fetcher: MockFetcher) -> TopicSession {
        session_with(fetcher, SessionConfig::default())
    }

    fn session_with(fetcher: MockFetcher, cfg: SessionConfig) -> TopicSession {
        TopicSession::new(
            Arc::new(fetcher),
            Arc::new(Mutex::new(TopicCache::new(
                cache::DEFAULT_MAX_ENTRIES,
                Duration::from_secs(300),
            ))),
            cfg,
        )
    }

    #[test]
    fn open_prefetches_initial_pages() {
        let (resp, all) = fixture();
        let mut session = session_with(
            MockFetcher::new(resp, all),
            SessionConfig {
                page_size: 20,
                initial_pages: 1,
            },
        );
        let view = session.open("https://linux.do/t/fixture/7").unwrap();
        assert_eq!(view.topic.id, 7);
        // 20 inline plus one prefetched page of 20.
        assert_eq!(view.tree.len(), 40);
        assert!(view.has_more);
        assert_eq!(session.remaining(), 10);
    }

    #[test]
    fn second_open_hits_cache() {
        use std::sync::atomic::Ordering;

        let (resp, all) = fixture();
        let mock = Arc::new(MockFetcher::new(resp, all));
        let mut session = TopicSession::new(
            mock.clone(),
            Arc::new(Mutex::new(TopicCache::default())),
            SessionConfig::default(),
        );
        session.open("https://linux.do/t/fixture/7").unwrap();
        let calls_after_first = mock.fetch_calls.load(Ordering::SeqCst);
        session.open("https://linux.do/t/fixture/7").unwrap();
        assert_eq!(mock.fetch_calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[test]
    fn load_more_pages_in_stream_order() {
        let (resp, all) = fixture();
        let mut session = session_with(
            MockFetcher::new(resp, all),
            SessionConfig {
                page_size: 20,
                initial_pages: 0,
            },
        );
        session.open("https://linux.do/t/fixture/7").unwrap();
        assert!(session.has_more());

        let batch = session.load_more().unwrap();
        let ids: Vec<u64> = batch.iter().map(|p| p.id).collect();
        assert_eq!(ids, (121..=140).collect::<Vec<u64>>());
        assert!(session.has_more());

        let batch = session.load_more().unwrap();
        let ids: Vec<u64> = batch.iter().map(|p| p.id).collect();
        assert_eq!(ids, (141..=150).collect::<Vec<u64>>());
        assert!(!session.has_more());
        assert_eq!(session.load_state(), Some(LoadState::Exhausted));

        // Exhausted is terminal; further triggers return nothing.
        assert!(session.load_more().unwrap().is_empty());
    }

    #[test]
    fn rebuild_tree_merges_paged_posts() {
        let (mut resp, mut all) = fixture();
        // Post 30 replies to post 2, which was loaded in the first window.
        all[29].reply_to_post_number = Some(2);
        resp.post_stream.posts = all[..20].to_vec();
        let mut session = session_with(
            MockFetcher::new(resp, all),
            SessionConfig {
                page_size: 20,
                initial_pages: 0,
            },
        );
        session.open("https://linux.do/t/fixture/7").unwrap();
        let flat = session.load_more().unwrap();
        assert!(flat.iter().any(|p| p.post_number == 30));

        let tree = session.rebuild_tree();
        let parent = tree
            .replies
            .iter()
            .find(|node| node.post.post_number == 2)
            .expect("post 2 at root");
        assert!(parent
            .children
            .iter()
            .any(|child| child.post.post_number == 30));
    }

    #[test]
    fn load_all_fetches_everything() {
        let (resp, all) = fixture();
        let mut session = session_with(
            MockFetcher::new(resp, all),
            SessionConfig {
                page_size: 20,
                initial_pages: 0,
            },
        );
        session.open("https://linux.do/t/fixture/7").unwrap();
        let mut lines = Vec::new();
        let view = session
            .load_all(&mut |line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(view.tree.len(), 50);
        assert!(!view.has_more);
        assert_eq!(lines, vec!["loaded 50 of 50"]);
    }

    #[test]
    fn total_batch_failure_allows_retry() {
        let (resp, all) = fixture();
        let mut fetcher = MockFetcher::new(resp, all);
        fetcher.failing_ids.insert(121);
        let mut session = session_with(
            fetcher,
            SessionConfig {
                page_size: 20,
                initial_pages: 0,
            },
        );
        session.open("https://linux.do/t/fixture/7").unwrap();
        let err = session.load_more().unwrap_err();
        assert!(matches!(err, FetchError::PartialBatch { .. }));
        // The guard was released; the next trigger retries.
        assert_eq!(session.load_state(), Some(LoadState::Idle));
    }

    #[test]
    fn content_authored_invalidates_and_appends() {
        let (resp, all) = fixture();
        let mut session = session(MockFetcher::new(resp, all));
        session.open("https://linux.do/t/fixture/7").unwrap();
        assert!(!session.cache.lock().is_empty());

        let new_post = post(999, 51, None);
        session.content_authored(7, Some(new_post));
        assert!(session.cache.lock().is_empty());
        let topic = session.topic().unwrap();
        assert_eq!(topic.posts_count, 51);
        assert!(topic.stream.contains(&999));
    }

    #[test]
    fn close_discards_state() {
        let (resp, all) = fixture();
        let mut session = session(MockFetcher::new(resp, all));
        session.open("https://linux.do/t/fixture/7").unwrap();
        session.close();
        assert!(session.topic().is_none());
        assert!(session.load_more().unwrap().is_empty());
    }

    #[test]
    fn optimistic_counters_invalidate_cache() {
        let (resp, all) = fixture();
        let mut session = session(MockFetcher::new(resp, all));
        session.open("https://linux.do/t/fixture/7").unwrap();
        session.apply_topic_like(1);
        assert_eq!(session.topic().unwrap().like_count, 4);
        assert!(session.cache.lock().is_empty());
        session.set_bookmarked(true);
        assert!(session.topic().unwrap().bookmarked);
    }
}
