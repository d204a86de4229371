use std::collections::HashMap;

use crate::discourse::Post;

/// A reply plus the replies nested under it. Children stay in ascending
/// sequence order, matching the order they arrived in the input.
#[derive(Debug, Clone)]
pub struct ReplyNode {
    pub post: Post,
    pub children: Vec<ReplyNode>,
}

#[derive(Debug, Clone, Default)]
pub struct TopicTree {
    pub original: Option<Post>,
    pub replies: Vec<ReplyNode>,
}

impl TopicTree {
    pub fn is_empty(&self) -> bool {
        self.original.is_none() && self.replies.is_empty()
    }

    /// Total posts held by the tree, original included.
    pub fn len(&self) -> usize {
        fn count(nodes: &[ReplyNode]) -> usize {
            nodes
                .iter()
                .map(|node| 1 + count(&node.children))
                .sum()
        }
        usize::from(self.original.is_some()) + count(&self.replies)
    }
}

/// Builds the original post plus a forest of reply nodes from a flat,
/// sequence-ordered post list.
///
/// The first element is the original post. Every other post hangs under
/// the post its reply target names; a post with no target, a target
/// equal to the original, or a target absent from the input becomes a
/// root-level reply. Reply targets always name strictly earlier
/// sequence numbers, so a single pass with a sequence-keyed index is
/// enough and no cycle handling is needed.
pub fn build(posts: Vec<Post>) -> TopicTree {
    let mut iter = posts.into_iter();
    let original = match iter.next() {
        Some(post) => post,
        None => return TopicTree::default(),
    };
    let op_number = original.post_number;
    let rest: Vec<Post> = iter.collect();

    let mut index: HashMap<u32, usize> = HashMap::with_capacity(rest.len());
    for (i, post) in rest.iter().enumerate() {
        index.insert(post.post_number, i);
    }

    // First resolve parent/child edges by index, then assemble owned
    // nodes from the back: a child always sits after its parent, so by
    // the time a parent is visited all of its children are final.
    let mut child_indexes: Vec<Vec<usize>> = vec![Vec::new(); rest.len()];
    let mut root_indexes: Vec<usize> = Vec::new();
    for (i, post) in rest.iter().enumerate() {
        match post.reply_to_post_number {
            Some(target) if target != op_number => match index.get(&target) {
                Some(&parent) if parent != i => child_indexes[parent].push(i),
                _ => root_indexes.push(i),
            },
            _ => root_indexes.push(i),
        }
    }

    let mut nodes: Vec<Option<ReplyNode>> = rest
        .into_iter()
        .map(|post| {
            Some(ReplyNode {
                post,
                children: Vec::new(),
            })
        })
        .collect();
    for i in (0..nodes.len()).rev() {
        let children: Vec<ReplyNode> = child_indexes[i]
            .iter()
            .filter_map(|&child| nodes[child].take())
            .collect();
        if let Some(node) = nodes[i].as_mut() {
            node.children = children;
        }
    }

    let replies = root_indexes
        .into_iter()
        .filter_map(|i| nodes[i].take())
        .collect();

    TopicTree {
        original: Some(original),
        replies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn post(id: u64, number: u32, username: &str, reply_to: Option<u32>) -> Post {
        Post {
            id,
            post_number: number,
            username: username.to_string(),
            display_username: username.to_string(),
            created_at: Utc::now(),
            cooked: format!("<p>post {number}</p>"),
            reply_to_post_number: reply_to,
            actions_summary: Vec::new(),
            topic_id: 1,
            avatar_template: String::new(),
        }
    }

    fn shape(nodes: &[ReplyNode]) -> Vec<(u32, Vec<(u32, Vec<u32>)>)> {
        nodes
            .iter()
            .map(|node| {
                (
                    node.post.post_number,
                    node.children
                        .iter()
                        .map(|child| {
                            (
                                child.post.post_number,
                                child
                                    .children
                                    .iter()
                                    .map(|grand| grand.post.post_number)
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn empty_input_yields_empty_tree() {
        let tree = build(Vec::new());
        assert!(tree.original.is_none());
        assert!(tree.replies.is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn nests_replies_under_their_targets() {
        // OP alice, bob replies to the topic, carol replies to bob.
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", None),
            post(12, 3, "carol", Some(2)),
        ];
        let tree = build(posts);
        let original = tree.original.as_ref().unwrap();
        assert_eq!(original.username, "alice");
        assert_eq!(tree.replies.len(), 1);
        assert_eq!(tree.replies[0].post.username, "bob");
        assert_eq!(tree.replies[0].children.len(), 1);
        assert_eq!(tree.replies[0].children[0].post.username, "carol");
        assert!(tree.replies[0].children[0].children.is_empty());
    }

    #[test]
    fn reply_to_original_stays_at_root() {
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", Some(1)),
            post(12, 3, "carol", Some(1)),
        ];
        let tree = build(posts);
        assert_eq!(shape(&tree.replies), vec![(2, vec![]), (3, vec![])]);
    }

    #[test]
    fn missing_parent_falls_back_to_root() {
        // Post 5 targets sequence 4, which was never materialized.
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", None),
            post(13, 5, "dave", Some(4)),
        ];
        let tree = build(posts);
        assert_eq!(shape(&tree.replies), vec![(2, vec![]), (5, vec![])]);
    }

    #[test]
    fn every_post_appears_exactly_once() {
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", None),
            post(12, 3, "carol", Some(2)),
            post(13, 4, "dave", Some(3)),
            post(14, 5, "erin", Some(2)),
            post(15, 6, "frank", Some(9)),
        ];
        let tree = build(posts.clone());
        assert_eq!(tree.len(), posts.len());

        let mut seen = Vec::new();
        fn walk(nodes: &[ReplyNode], seen: &mut Vec<u32>) {
            for node in nodes {
                seen.push(node.post.post_number);
                walk(&node.children, seen);
            }
        }
        walk(&tree.replies, &mut seen);
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn build_is_idempotent() {
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", None),
            post(12, 3, "carol", Some(2)),
            post(13, 4, "dave", Some(2)),
            post(14, 5, "erin", Some(4)),
        ];
        let first = build(posts.clone());
        let second = build(posts);
        assert_eq!(shape(&first.replies), shape(&second.replies));
        assert_eq!(
            first.original.as_ref().map(|p| p.id),
            second.original.as_ref().map(|p| p.id)
        );
    }

    #[test]
    fn children_preserve_sequence_order() {
        let posts = vec![
            post(10, 1, "alice", None),
            post(11, 2, "bob", None),
            post(14, 5, "erin", Some(2)),
            post(12, 3, "carol", Some(2)),
        ];
        // Input order is canonical; children come out in that order.
        let tree = build(posts);
        let children: Vec<u32> = tree.replies[0]
            .children
            .iter()
            .map(|node| node.post.post_number)
            .collect();
        assert_eq!(children, vec![5, 3]);
    }
}
