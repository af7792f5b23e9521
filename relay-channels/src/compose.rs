//! Splitting blocking answers into reply fragments.
//!
//! A Dify answer is markdown. Images (`![alt](url)`) and links
//! (`[text](url)`) become their own fragments so the host can send them as
//! media; the text around them is kept in document order.

use regex::Regex;
use std::sync::LazyLock;

use crate::message::Fragment;

/// Image link, or plain link. Group 2 is the image target, group 3 the link target.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\[.*?\]\((.*?)\)|\[.*?\]\((.*?)\))").expect("link regex is valid")
});

/// Split an answer into text, image and file fragments.
///
/// Text between links is trimmed; consecutive pieces are joined without a
/// separator and flushed when the next link starts. Link targets are
/// returned as written, see [`resolve_url`] for completing relative ones.
/// A link with an empty target produces no fragment.
pub fn parse_answer(answer: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut text = String::new();
    let mut last = 0;

    for caps in LINK_RE.captures_iter(answer) {
        let Some(whole) = caps.get(0) else { continue };
        text.push_str(answer[last..whole.start()].trim());
        last = whole.end();

        if !text.is_empty() {
            fragments.push(Fragment::Text(std::mem::take(&mut text)));
        }

        let image = caps.get(2).map_or("", |m| m.as_str());
        let file = caps.get(3).map_or("", |m| m.as_str());
        if !image.is_empty() {
            fragments.push(Fragment::ImageUrl(image.to_string()));
        } else if !file.is_empty() {
            fragments.push(Fragment::File(file.to_string()));
        }
    }

    text.push_str(answer[last..].trim());
    if !text.is_empty() {
        fragments.push(Fragment::Text(text));
    }
    fragments
}

/// Complete a link target against the file base URL.
///
/// Absolute `http`/`https` targets are returned unchanged; anything else is
/// appended to `base` verbatim.
pub fn resolve_url(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("{base}{target}")
    }
}

/// Resolve the targets of image and file fragments in place.
pub fn resolve_fragments(base: &str, fragments: Vec<Fragment>) -> Vec<Fragment> {
    fragments
        .into_iter()
        .map(|f| match f {
            Fragment::ImageUrl(url) => Fragment::ImageUrl(resolve_url(base, &url)),
            Fragment::File(url) => Fragment::File(resolve_url(base, &url)),
            text @ Fragment::Text(_) => text,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_answer() {
        let fragments = parse_answer("pic ![a](http://x/i.png) and [doc](/d.pdf) end");
        assert_eq!(
            fragments,
            vec![
                Fragment::text("pic"),
                Fragment::ImageUrl("http://x/i.png".into()),
                Fragment::text("and"),
                Fragment::File("/d.pdf".into()),
                Fragment::text("end"),
            ]
        );
    }

    #[test]
    fn test_plain_answer_is_one_fragment() {
        assert_eq!(
            parse_answer("  just some text\n  "),
            vec![Fragment::text("just some text")]
        );
    }

    #[test]
    fn test_empty_answer() {
        assert!(parse_answer("").is_empty());
        assert!(parse_answer("   ").is_empty());
    }

    #[test]
    fn test_adjacent_links_have_no_text_between() {
        let fragments = parse_answer("![a](/1.png)![b](/2.png)");
        assert_eq!(
            fragments,
            vec![
                Fragment::ImageUrl("/1.png".into()),
                Fragment::ImageUrl("/2.png".into()),
            ]
        );
    }

    #[test]
    fn test_multiline_text_keeps_inner_newlines() {
        let fragments = parse_answer("line one\nline two ![i](/a.png)\n tail");
        assert_eq!(
            fragments,
            vec![
                Fragment::text("line one\nline two"),
                Fragment::ImageUrl("/a.png".into()),
                Fragment::text("tail"),
            ]
        );
    }

    #[test]
    fn test_empty_target_emits_nothing() {
        let fragments = parse_answer("before [nothing]() after");
        assert_eq!(
            fragments,
            vec![Fragment::text("before"), Fragment::text("after")]
        );
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(resolve_url("https://host", "/d.pdf"), "https://host/d.pdf");
        assert_eq!(
            resolve_url("https://host", "http://cdn/x.png"),
            "http://cdn/x.png"
        );
        assert_eq!(
            resolve_url("https://host", "https://cdn/x.png"),
            "https://cdn/x.png"
        );
    }

    #[test]
    fn test_resolve_fragments_leaves_text() {
        let resolved = resolve_fragments(
            "https://host",
            vec![
                Fragment::text("/not-a-link"),
                Fragment::File("/files/a.pdf".into()),
                Fragment::ImageUrl("https://cdn/b.png".into()),
            ],
        );
        assert_eq!(
            resolved,
            vec![
                Fragment::text("/not-a-link"),
                Fragment::File("https://host/files/a.pdf".into()),
                Fragment::ImageUrl("https://cdn/b.png".into()),
            ]
        );
    }
}
