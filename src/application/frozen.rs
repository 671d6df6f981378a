//! Frozen-region extraction over rendered page markup.
//!
//! Elements carrying `data-static` mark subtrees the client may adopt instead
//! of re-rendering. The attribute holds either an explicit id or one of the
//! auto placeholders `__ROUTE__` / `__SHARED__`, which resolve to sequential
//! integers in document order from two independent counters. Shared ids are
//! emitted as `shared:<n>` so the two sequences never collide.

use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use frostline_protocol::RegionMap;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use thiserror::Error;

pub const STATIC_ATTRIBUTE: &str = "data-static";
pub const ROUTE_PLACEHOLDER: &str = "__ROUTE__";
pub const SHARED_PLACEHOLDER: &str = "__SHARED__";
pub const SHARED_PREFIX: &str = "shared:";

const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];
const RAW_TEXT_ELEMENTS: [&str; 4] = ["script", "style", "textarea", "title"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to rewrite region markers: {message}")]
    Rewrite { message: String },
    #[error("frozen region id `{id}` is used more than once")]
    DuplicateId { id: String },
    #[error("`{STATIC_ATTRIBUTE}` attribute must not be empty")]
    EmptyId,
    #[error("found {found} region markers in markup but resolved {expected}")]
    MarkerMismatch { expected: usize, found: usize },
    #[error("frozen region `{id}` opens a <{tag}> that is never closed")]
    Unclosed { id: String, tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenRegion {
    pub id: String,
    pub outer_markup: String,
}

/// Placeholder-rewritten markup plus the regions found in it, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub html: String,
    pub regions: Vec<FrozenRegion>,
}

impl Extraction {
    pub fn region_map(&self) -> RegionMap {
        self.regions
            .iter()
            .map(|region| (region.id.clone(), region.outer_markup.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[derive(Default)]
struct MarkerState {
    route_counter: usize,
    shared_counter: usize,
    ids: Vec<String>,
    seen: BTreeSet<String>,
}

impl MarkerState {
    fn resolve(&mut self, raw: &str) -> Result<String, ExtractError> {
        let id = match raw.trim() {
            "" => return Err(ExtractError::EmptyId),
            ROUTE_PLACEHOLDER => {
                let id = self.route_counter.to_string();
                self.route_counter += 1;
                id
            }
            SHARED_PLACEHOLDER => {
                let id = format!("{SHARED_PREFIX}{}", self.shared_counter);
                self.shared_counter += 1;
                id
            }
            explicit => explicit.to_string(),
        };
        if !self.seen.insert(id.clone()) {
            return Err(ExtractError::DuplicateId { id });
        }
        self.ids.push(id.clone());
        Ok(id)
    }
}

/// Resolve placeholders and capture the outer markup of every marked element.
pub fn extract(html: &str) -> Result<Extraction, ExtractError> {
    let (rewritten, ids) = resolve_markers(html)?;
    if ids.is_empty() {
        return Ok(Extraction {
            html: rewritten,
            regions: Vec::new(),
        });
    }

    let tags = scan_tags(&rewritten);
    let marked: Vec<usize> = tags
        .iter()
        .enumerate()
        .filter(|(_, tag)| matches!(tag.kind, TagKind::Open { is_static: true, .. }))
        .map(|(index, _)| index)
        .collect();

    if marked.len() != ids.len() {
        return Err(ExtractError::MarkerMismatch {
            expected: ids.len(),
            found: marked.len(),
        });
    }

    let mut regions = Vec::with_capacity(ids.len());
    for (index, id) in marked.into_iter().zip(ids) {
        let open = &tags[index];
        let end = match open.kind {
            TagKind::Open {
                self_closing: true, ..
            } => open.end,
            _ if is_void(open.name) => open.end,
            _ => matching_close(&tags, index).ok_or_else(|| ExtractError::Unclosed {
                id: id.clone(),
                tag: open.name.to_string(),
            })?,
        };
        regions.push(FrozenRegion {
            id,
            outer_markup: rewritten[open.start..end].to_string(),
        });
    }

    Ok(Extraction {
        html: rewritten,
        regions,
    })
}

fn resolve_markers(html: &str) -> Result<(String, Vec<String>), ExtractError> {
    let state = Rc::new(RefCell::new(MarkerState::default()));
    let error_slot = Rc::new(RefCell::new(None));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("[data-static]", {
                let state = Rc::clone(&state);
                let error_slot = Rc::clone(&error_slot);
                move |el| {
                    if error_slot.borrow().is_some() {
                        return Ok(());
                    }
                    let raw = el.get_attribute(STATIC_ATTRIBUTE).unwrap_or_default();
                    match state.borrow_mut().resolve(&raw) {
                        Ok(id) => {
                            if id != raw {
                                el.set_attribute(STATIC_ATTRIBUTE, &id)?;
                            }
                        }
                        Err(err) => *error_slot.borrow_mut() = Some(err),
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| ExtractError::Rewrite {
        message: err.to_string(),
    })?;

    if let Some(err) = error_slot.borrow_mut().take() {
        return Err(err);
    }

    let ids = std::mem::take(&mut state.borrow_mut().ids);
    Ok((rewritten, ids))
}

#[derive(Debug, Clone, Copy)]
enum TagKind {
    Open { self_closing: bool, is_static: bool },
    Close,
}

#[derive(Debug)]
struct Tag<'a> {
    name: &'a str,
    start: usize,
    end: usize,
    kind: TagKind,
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS
        .iter()
        .any(|void| void.eq_ignore_ascii_case(name))
}

/// Tokenize element tags, skipping comments, doctypes and raw-text bodies.
fn scan_tags(html: &str) -> Vec<Tag<'_>> {
    let mut tags = Vec::new();
    let mut pos = 0;

    while let Some(offset) = html[pos..].find('<') {
        let start = pos + offset;
        let rest = &html[start..];

        if rest.starts_with("<!--") {
            pos = rest.find("-->").map_or(html.len(), |end| start + end + 3);
            continue;
        }
        if rest.starts_with("<!") || rest.starts_with("<?") {
            pos = rest.find('>').map_or(html.len(), |end| start + end + 1);
            continue;
        }

        let closing = rest.starts_with("</");
        let name_start = start + if closing { 2 } else { 1 };
        let name_len = html[name_start..]
            .bytes()
            .take_while(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b':' | b'_'))
            .count();
        if name_len == 0 {
            pos = start + 1;
            continue;
        }
        let name_end = name_start + name_len;
        let name = &html[name_start..name_end];

        let Some(end) = tag_end(html, name_end) else {
            break;
        };

        if closing {
            tags.push(Tag {
                name,
                start,
                end,
                kind: TagKind::Close,
            });
            pos = end;
            continue;
        }

        let attributes = &html[name_end..end - 1];
        let self_closing = attributes.trim_end().ends_with('/');
        tags.push(Tag {
            name,
            start,
            end,
            kind: TagKind::Open {
                self_closing,
                is_static: has_attribute(attributes, STATIC_ATTRIBUTE),
            },
        });

        pos = end;
        if !self_closing
            && RAW_TEXT_ELEMENTS
                .iter()
                .any(|raw| raw.eq_ignore_ascii_case(name))
        {
            let needle = format!("</{}", name.to_ascii_lowercase());
            pos = html[end..]
                .to_ascii_lowercase()
                .find(&needle)
                .map_or(html.len(), |offset| end + offset);
        }
    }

    tags
}

/// Index one past the `>` that closes a tag, honouring quoted attribute values.
fn tag_end(html: &str, from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (offset, byte) in html.as_bytes()[from..].iter().enumerate() {
        match (quote, *byte) {
            (Some(open), current) if open == current => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(*byte),
            (None, b'>') => return Some(from + offset + 1),
            (None, _) => {}
        }
    }
    None
}

fn has_attribute(attributes: &str, wanted: &str) -> bool {
    let bytes = attributes.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        while index < bytes.len() && (bytes[index].is_ascii_whitespace() || bytes[index] == b'/') {
            index += 1;
        }
        let name_start = index;
        while index < bytes.len()
            && !bytes[index].is_ascii_whitespace()
            && !matches!(bytes[index], b'=' | b'/' | b'>')
        {
            index += 1;
        }
        if name_start == index {
            break;
        }
        if attributes[name_start..index].eq_ignore_ascii_case(wanted) {
            return true;
        }

        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        if index < bytes.len() && bytes[index] == b'=' {
            index += 1;
            while index < bytes.len() && bytes[index].is_ascii_whitespace() {
                index += 1;
            }
            match bytes.get(index) {
                Some(&quote @ (b'"' | b'\'')) => {
                    index += 1;
                    while index < bytes.len() && bytes[index] != quote {
                        index += 1;
                    }
                    index += 1;
                }
                _ => {
                    while index < bytes.len() && !bytes[index].is_ascii_whitespace() {
                        index += 1;
                    }
                }
            }
        }
    }

    false
}

fn matching_close(tags: &[Tag<'_>], open_index: usize) -> Option<usize> {
    let name = tags[open_index].name;
    let mut depth = 1usize;
    for tag in &tags[open_index + 1..] {
        if !tag.name.eq_ignore_ascii_case(name) {
            continue;
        }
        match tag.kind {
            TagKind::Open {
                self_closing: false,
                ..
            } => depth += 1,
            TagKind::Open { .. } => {}
            TagKind::Close => {
                depth -= 1;
                if depth == 0 {
                    return Some(tag.end);
                }
            }
        }
    }
    None
}
