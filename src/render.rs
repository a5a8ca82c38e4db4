//! Plain-text rendering of a reply tree for the CLI.

use chrono::{DateTime, Utc};
use rebuttal::thread::{ReplyId, ReplyNode, TreeCache};
use rebuttal::util::{sanitize_line, truncate_to_width};

const INDENT: usize = 4;

/// Renders the visible tree, one header line and one content line per reply.
/// Children are shown only under expanded parents.
pub fn render_tree(cache: &TreeCache, width: usize, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();
    for node in cache.top_level() {
        render_node(cache, node, width, now, &mut lines);
    }
    lines
}

fn render_node(
    cache: &TreeCache,
    node: &ReplyNode,
    width: usize,
    now: DateTime<Utc>,
    lines: &mut Vec<String>,
) {
    let indent = usize::from(node.depth.get()) * INDENT;
    let avail = width.saturating_sub(indent).max(1);
    let pad = " ".repeat(indent);

    lines.push(format!("{pad}{}", truncate_to_width(&header(node, now), avail)));
    let content = sanitize_line(node.display_content());
    lines.push(format!("{pad}  {}", truncate_to_width(&content, avail.saturating_sub(2).max(1))));

    if cache.is_expanded(&node.id) {
        for child in cache.children_of(&node.id) {
            render_node(cache, child, width, now, lines);
        }
    }
    if let Some(more) = hidden_replies(cache, &node.id, node.child_count) {
        let child_pad = " ".repeat(indent + INDENT);
        lines.push(format!("{child_pad}[+{more} {}]", plural(more, "reply", "replies")));
    }
}

fn header(node: &ReplyNode, now: DateTime<Utc>) -> String {
    let vote = if node.upvoted { "▲" } else { "△" };
    let author = if node.is_deleted {
        "[deleted]".to_string()
    } else {
        sanitize_line(&node.author.display_name).into_owned()
    };
    let mut out = format!(
        "{vote} {:>3}  {author}  {}  ({})",
        node.upvote_count,
        relative_age(node.created_at, now),
        node.id
    );
    if node.is_edited && !node.is_deleted {
        out.push_str("  (edited)");
    }
    if node.child_count > 0 {
        out.push_str(&format!(
            "  · {} {}",
            node.child_count,
            plural(node.child_count, "reply", "replies")
        ));
    }
    out
}

/// Replies the server reports under `id` that are not on screen.
fn hidden_replies(cache: &TreeCache, id: &ReplyId, child_count: u32) -> Option<u32> {
    let shown = if cache.is_expanded(id) {
        u32::try_from(cache.children_of(id).len()).unwrap_or(u32::MAX)
    } else {
        0
    };
    let more = child_count.saturating_sub(shown);
    (more > 0).then_some(more)
}

fn plural(n: u32, one: &'static str, many: &'static str) -> &'static str {
    if n == 1 {
        one
    } else {
        many
    }
}

/// Coarse age like `5m`, `3h` or `2d`. Future timestamps read as `now`.
pub fn relative_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    match secs {
        0..=59 => "now".to_string(),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        86_400..=2_591_999 => format!("{}d", secs / 86_400),
        _ => created_at.format("%Y-%m-%d").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use rebuttal::thread::{Author, Depth};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
    }

    fn reply(id: &str, parent: Option<&str>, depth: u8, child_count: u32) -> ReplyNode {
        ReplyNode {
            id: ReplyId::from(id),
            parent_id: parent.map(ReplyId::from),
            depth: Depth::new(depth).unwrap(),
            content: format!("text of {id}"),
            is_deleted: false,
            author: Author {
                id: "u1".to_string(),
                display_name: "Ada".to_string(),
                avatar_url: None,
            },
            created_at: now() - Duration::hours(2),
            is_edited: false,
            upvoted: false,
            upvote_count: 4,
            child_count,
            is_owner: false,
        }
    }

    #[test]
    fn test_relative_age() {
        assert_eq!(relative_age(now(), now()), "now");
        assert_eq!(relative_age(now() - Duration::minutes(5), now()), "5m");
        assert_eq!(relative_age(now() - Duration::hours(3), now()), "3h");
        assert_eq!(relative_age(now() - Duration::days(2), now()), "2d");
        assert_eq!(relative_age(now() + Duration::minutes(5), now()), "now");
        assert_eq!(relative_age(now() - Duration::days(90), now()), "2024-02-02");
    }

    #[test]
    fn test_collapsed_parent_shows_hidden_count() {
        let mut cache = TreeCache::new();
        cache.replace_top_level(vec![reply("p", None, 0, 2)], false);

        let lines = render_tree(&cache, 80, now());
        assert_eq!(
            lines,
            vec![
                "△   4  Ada  2h  (p)  · 2 replies".to_string(),
                "  text of p".to_string(),
                "    [+2 replies]".to_string(),
            ]
        );
    }

    #[test]
    fn test_expanded_children_indented() {
        let mut cache = TreeCache::new();
        cache.replace_top_level(vec![reply("p", None, 0, 1)], false);
        cache.set_children(&ReplyId::from("p"), vec![reply("c", Some("p"), 1, 0)], false);

        let lines = render_tree(&cache, 80, now());
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "    △   4  Ada  2h  (c)");
        assert_eq!(lines[3], "      text of c");
    }

    #[test]
    fn test_tombstone_and_control_chars() {
        let mut gone = reply("d", None, 0, 0);
        gone.is_deleted = true;
        gone.content.clear();
        let mut noisy = reply("n", None, 0, 0);
        noisy.content = "line one\n\x1b[31mred\x1b[0m".to_string();

        let mut cache = TreeCache::new();
        cache.replace_top_level(vec![gone, noisy], false);
        let lines = render_tree(&cache, 80, now());
        assert!(lines[0].contains("[deleted]"));
        assert_eq!(lines[1], "  [deleted]");
        assert_eq!(lines[3], "  line one red");
    }

    #[test]
    fn test_lines_truncated_to_width() {
        let mut long = reply("l", None, 0, 0);
        long.content = "word ".repeat(50);
        let mut cache = TreeCache::new();
        cache.replace_top_level(vec![long], false);

        for line in render_tree(&cache, 30, now()) {
            assert!(rebuttal::util::display_width(&line) <= 30, "{line}");
        }
    }
}
