use anyhow::{bail, Result};
use fxhash::FxHashSet;
use html_escape::{encode_double_quoted_attribute, encode_text};
use serde_json::Value;

use crate::plugins::Htmlifier;

/// What a tag decorates. The three variants are a closed set: anonymous line
/// markers inserted at every line boundary, syntax regions rendered as
/// `<span>`, and cross-reference anchors rendered as `<a>` with an attached
/// context menu.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Line,
    Region { class: String },
    Anchor { menu: Value },
}

impl Payload {
    // Lines sort outermost, then anchors, then regions. Splitting a region
    // is harmless; splitting an anchor makes for a weird UI, so anchors stay
    // outside regions whenever boundaries coincide.
    fn rank(&self) -> i32 {
        match self {
            Payload::Line => 0,
            Payload::Anchor { .. } => 1,
            Payload::Region { .. } => 2,
        }
    }

    fn opener(&self) -> String {
        match self {
            Payload::Line => String::new(),
            Payload::Region { class } => {
                format!("<span class=\"{}\">", encode_double_quoted_attribute(class))
            }
            Payload::Anchor { menu } => {
                let menu = serde_json::to_string(menu).expect("JSON menu serialization");
                format!("<a data-menu=\"{}\">", encode_double_quoted_attribute(&menu))
            }
        }
    }

    fn closer(&self) -> &'static str {
        match self {
            Payload::Line => "",
            Payload::Region { .. } => "</span>",
            Payload::Anchor { .. } => "</a>",
        }
    }
}

/// Identity of one payload within a file's tag stream. The balancer and the
/// renderer must know *which* open pairs with *which* close, so every
/// payload, each line marker included, gets its own id at ingestion and all
/// matching is done on ids, never on payload equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(usize);

/// Arena of the payloads referenced by a tag stream.
#[derive(Debug, Default)]
pub struct TagSet {
    payloads: Vec<Payload>,
}

impl TagSet {
    pub fn insert(&mut self, payload: Payload) -> TagId {
        self.payloads.push(payload);
        TagId(self.payloads.len() - 1)
    }

    pub fn payload(&self, id: TagId) -> &Payload {
        &self.payloads[id.0]
    }
}

/// One endpoint of a tagged span. `offset` follows the slice convention: it
/// names the byte the boundary comes before.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    pub offset: usize,
    pub is_start: bool,
    pub tag: TagId,
}

fn is_line_terminator(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r'
            | '\x0b'
            | '\x0c'
            | '\u{1c}'
            | '\u{1d}'
            | '\u{1e}'
            | '\u{85}'
            | '\u{2028}'
            | '\u{2029}'
    )
}

/// Split into lines on every universal line terminator, keeping the
/// terminator on its line. `\r\n` counts as a single terminator.
fn split_lines_keepends(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = rest.len();
        for (i, c) in rest.char_indices() {
            if is_line_terminator(c) {
                end = i + c.len_utf8();
                if c == '\r' && rest[end..].starts_with('\n') {
                    end += 1;
                }
                break;
            }
        }
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

/// Collect the start and end boundaries of every region and ref the
/// htmlifiers produce. Intervals are byte offsets over `text`; an inverted,
/// out-of-range, or char-splitting interval is a plugin contract violation
/// and fails the file.
pub fn tag_boundaries(
    set: &mut TagSet,
    htmlifiers: &[Box<dyn Htmlifier>],
    text: &str,
) -> Result<Vec<Boundary>> {
    let mut tags = Vec::new();
    for h in htmlifiers {
        let regions = h
            .regions()
            .into_iter()
            .map(|(start, end, class)| (start, end, Payload::Region { class }));
        let refs = h
            .refs()
            .into_iter()
            .map(|(start, end, menu)| (start, end, Payload::Anchor { menu }));
        for (start, end, payload) in regions.chain(refs) {
            if end <= start || end > text.len() {
                bail!("plugin produced a malformed interval [{start}, {end}) over {} bytes", text.len());
            }
            if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
                bail!("plugin interval [{start}, {end}) splits a UTF-8 character");
            }
            let tag = set.insert(payload);
            tags.push(Boundary { offset: start, is_start: true, tag });
            tags.push(Boundary { offset: end, is_start: false, tag });
        }
    }
    Ok(tags)
}

/// Append a line marker pair for every line of `text`. Start and end points
/// of adjacent lines coincide, right after the terminator. An empty file has
/// no lines and gets no markers.
pub fn line_boundaries(set: &mut TagSet, text: &str, tags: &mut Vec<Boundary>) {
    let mut up_to = 0;
    for line in split_lines_keepends(text) {
        let marker = set.insert(Payload::Line);
        tags.push(Boundary { offset: up_to, is_start: true, tag: marker });
        up_to += line.len();
        tags.push(Boundary { offset: up_to, is_start: false, tag: marker });
    }
}

/// Sort by the nesting-order key: offset first, ends before coincident
/// starts, and among coincident boundaries lines outermost, then anchors,
/// then regions (reversed for ends). A stable sort on this key is all the
/// balancer needs.
pub fn sort_tags(set: &TagSet, tags: &mut Vec<Boundary>) {
    tags.sort_by_key(|b| {
        let rank = set.payload(b.tag).rank();
        (b.offset, b.is_start, if b.is_start { rank } else { -rank })
    });
}

/// For any series of anchors that overlap each other, keep only the first.
/// There is no decent way to render overlapping `<a>` tags, so we don't
/// support it; a single plugin producing them is misbehaving, and across
/// plugins it merely costs the later anchor.
pub fn remove_overlapping_refs(tags: Vec<Boundary>, set: &TagSet) -> Vec<Boundary> {
    let mut open_ref: Option<TagId> = None;
    let mut blacklist: FxHashSet<TagId> = FxHashSet::default();
    tags.into_iter()
        .filter(|b| {
            if !matches!(set.payload(b.tag), Payload::Anchor { .. }) {
                return true;
            }
            if blacklist.remove(&b.tag) {
                // The close of an anchor whose open we suppressed.
                false
            } else if open_ref.is_none() {
                open_ref = Some(b.tag);
                true
            } else if open_ref == Some(b.tag) {
                open_ref = None;
                true
            } else {
                tracing::warn!("plugins requested overlapping anchors; keeping the first");
                blacklist.insert(b.tag);
                false
            }
        })
        .collect()
}

/// Come up with a balanced series of tags expressing the semantics of the
/// given sorted interleaved ones, without any zero-width spans. The output
/// isn't necessarily optimal, but it's fast and not embarrassingly wasteful
/// of space.
pub fn balanced_tags(tags: Vec<Boundary>) -> Vec<Boundary> {
    without_empty_tags(balanced_tags_with_empties(tags))
}

/// Reparenthesize with a temporary-close stack: whenever a span must close
/// while others are open inside it, close the inner ones at the same offset,
/// close it, and immediately reopen the inner ones. May emit zero-width
/// spans.
fn balanced_tags_with_empties(tags: Vec<Boundary>) -> Vec<Boundary> {
    let mut out = Vec::with_capacity(tags.len());
    // Tags currently open, in nesting order.
    let mut opens: Vec<TagId> = Vec::new();
    // Tags temporarily closed so an overlapping one could close.
    let mut closes: Vec<TagId> = Vec::new();

    for b in tags {
        if b.is_start {
            out.push(b);
            opens.push(b.tag);
        } else {
            loop {
                let top = *opens.last().expect("unbalanced tag stream: close without open");
                if top == b.tag {
                    break;
                }
                opens.pop();
                out.push(Boundary { offset: b.offset, is_start: false, tag: top });
                closes.push(top);
            }
            out.push(b);
            opens.pop();
            while let Some(tag) = closes.pop() {
                out.push(Boundary { offset: b.offset, is_start: true, tag });
                opens.push(tag);
            }
        }
    }
    out
}

/// Filter zero-width tagged spans out of a balanced stream, preserving
/// order. A close cancels the immediately preceding open when both carry the
/// same tag id at the same offset; runs are buffered until the depth returns
/// to zero so cancellation can't split an enclosing span.
fn without_empty_tags(tags: Vec<Boundary>) -> Vec<Boundary> {
    let mut out = Vec::with_capacity(tags.len());
    let mut buffer: Vec<Boundary> = Vec::new();
    let mut depth = 0usize;

    for b in tags {
        if b.is_start {
            buffer.push(b);
            depth += 1;
        } else {
            match buffer.last() {
                Some(top) if top.is_start && top.tag == b.tag && top.offset == b.offset => {
                    buffer.pop();
                }
                _ => buffer.push(b),
            }
            depth -= 1;
            if depth == 0 {
                out.append(&mut buffer);
            }
        }
    }
    out
}

/// Render a balanced stream to HTML, interleaved with the escaped source
/// slices it decorates, split into fragments at line ends.
///
/// Line endpoints in the balanced stream sit at the correct offsets but are
/// often no longer outermost on their line (they gave that up to force
/// line-spanning tags closed before each line's end), so a line end is noted
/// when its close goes by and the fragment is emitted at the first open
/// boundary at or past that offset. Within a balanced stream all closes at an
/// offset precede all opens, which makes the first open the right flush
/// point. Whatever is still accumulated at the end of the stream is flushed
/// as the final fragment.
pub fn html_lines(tags: &[Boundary], set: &TagSet, text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut segments: Vec<String> = Vec::new();
    let mut up_to = 0usize;
    let mut line_ends_at: Option<usize> = None;

    for b in tags {
        let slice = &text[up_to..b.offset];
        segments.push(encode_text(slice.trim_end_matches(['\r', '\n'])).into_owned());
        up_to = b.offset;

        if let Some(end) = line_ends_at {
            if b.is_start || b.offset > end {
                lines.push(segments.concat());
                segments.clear();
                line_ends_at = None;
            }
        }

        match set.payload(b.tag) {
            Payload::Line => {
                if !b.is_start {
                    line_ends_at = Some(b.offset);
                }
            }
            payload => {
                if b.is_start {
                    segments.push(payload.opener());
                } else {
                    segments.push(payload.closer().to_string());
                }
            }
        }
    }
    if !segments.is_empty() {
        lines.push(segments.concat());
    }
    lines
}

/// Run the whole decoration pipeline for one file: collect intervals from
/// the htmlifiers, add line markers, sort, drop overlapping anchors, balance,
/// and render the line-split HTML fragments.
pub fn build_lines(text: &str, htmlifiers: &[Box<dyn Htmlifier>]) -> Result<Vec<String>> {
    let mut set = TagSet::default();
    let mut tags = tag_boundaries(&mut set, htmlifiers, text)?;
    line_boundaries(&mut set, text, &mut tags);
    sort_tags(&set, &mut tags);
    let tags = remove_overlapping_refs(tags, &set);
    let tags = balanced_tags(tags);
    Ok(html_lines(&tags, &set, text))
}
