//! Per-variant rewrite rules.
//!
//! Each rule pairs a matcher with a rewrite and the number of sites it must
//! find. Matchers target the engine's compiled output, which carries no
//! stability guarantee; a count mismatch is reported instead of guessed at.

use regex::Captures;

use super::{REGION_PREFIX, REGISTRY_GLOBAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVariant {
    /// Formatted kernel output; region ids may be tagged values.
    Classic,
    /// Whitespace-stripped output; region ids are string-prefixed refs.
    Compact,
}

impl EngineVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineVariant::Classic => "classic",
            EngineVariant::Compact => "compact",
        }
    }
}

pub struct Rule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub required: usize,
    pub rewrite: fn(&Captures<'_>) -> String,
}

pub(super) const CLASSIC_DIFF_SIGNATURE: &str = r"function _VirtualDom_diffHelp\(x, y, patches, index\)\s*\{";
pub(super) const COMPACT_DIFF_SIGNATURE: &str = r"function _VirtualDom_diffHelp\(x,y,patches,index\)\{";

pub fn rules(variant: EngineVariant) -> &'static [Rule] {
    match variant {
        EngineVariant::Classic => &CLASSIC,
        EngineVariant::Compact => &COMPACT,
    }
}

static CLASSIC: [Rule; 3] = [
    Rule {
        name: "inject-helpers",
        pattern: CLASSIC_DIFF_SIGNATURE,
        required: 1,
        rewrite: |caps| format!("{}\n\n{}", classic_helpers(), &caps[0]),
    },
    Rule {
        name: "adopt-on-render",
        pattern: r"if \(tag === 5\)(\s*)\{(\s*)return _VirtualDom_render\(vNode\.k \|\| \(vNode\.k = vNode\.m\(\)\), eventNode\);",
        required: 1,
        rewrite: |caps| {
            format!(
                "if (tag === 5){open}{{{inner}var __frostlineDom = _Frostline_adopt(vNode);{inner}if (__frostlineDom) {{ return __frostlineDom; }}{inner}return _VirtualDom_render(vNode.k || (vNode.k = vNode.m()), eventNode);",
                open = &caps[1],
                inner = &caps[2],
            )
        },
    },
    Rule {
        name: "skip-or-replace-on-diff",
        pattern: r"case 5:(\s*)var xRefs = x\.l;",
        required: 1,
        rewrite: |caps| {
            format!(
                "case 5:{ws}if (_Frostline_diffThunk(x, y, patches, index)) {{ return; }}{ws}var xRefs = x.l;",
                ws = &caps[1],
            )
        },
    },
];

static COMPACT: [Rule; 3] = [
    Rule {
        name: "inject-helpers",
        pattern: COMPACT_DIFF_SIGNATURE,
        required: 1,
        rewrite: |caps| format!("{};{}", compact_helpers(), &caps[0]),
    },
    Rule {
        name: "adopt-on-render",
        pattern: r"if\(tag===5\)\{return _VirtualDom_render\(vNode\.k\|\|\(vNode\.k=vNode\.m\(\)\),eventNode\);",
        required: 1,
        rewrite: |_| {
            "if(tag===5){var __frostlineDom=_Frostline_adopt(vNode);if(__frostlineDom){return __frostlineDom;}return _VirtualDom_render(vNode.k||(vNode.k=vNode.m()),eventNode);".to_string()
        },
    },
    Rule {
        name: "skip-or-replace-on-diff",
        pattern: r"case 5:var xRefs=x\.l;",
        required: 1,
        rewrite: |_| "case 5:if(_Frostline_diffThunk(x,y,patches,index)){return;}var xRefs=x.l;".to_string(),
    },
];

/// Shared adoption helpers. `region_id` is the variant-specific lookup.
fn helpers(region_id: &str) -> String {
    format!(
        r#"var _Frostline_prefix = "{REGION_PREFIX}";
{region_id}
function _Frostline_adopt(vNode)
{{
	if (vNode.__frostlineDom) {{ return vNode.__frostlineDom; }}
	var id = _Frostline_regionId(vNode);
	if (id === null || typeof document === "undefined") {{ return null; }}
	var selector = "[data-static=\"" + (typeof CSS !== "undefined" && CSS.escape ? CSS.escape(id) : id) + "\"]";
	var node = document.querySelector(selector);
	if (node) {{ vNode.__frostlineDom = node; }}
	return node;
}}
function _Frostline_diffThunk(x, y, patches, index)
{{
	var xId = _Frostline_regionId(x);
	var yId = _Frostline_regionId(y);
	if (xId === null || yId === null) {{ return false; }}
	if (xId === yId)
	{{
		y.k = x.k;
		y.__frostlineDom = x.__frostlineDom;
		return true;
	}}
	var registry = globalThis.{REGISTRY_GLOBAL} || {{}};
	var markup = registry[yId];
	if (typeof markup !== "string" || typeof document === "undefined") {{ return false; }}
	var template = document.createElement("template");
	template.innerHTML = markup;
	var dom = template.content.firstElementChild;
	if (!dom) {{ return false; }}
	y.__frostlineDom = dom;
	_VirtualDom_pushPatch(patches, 0, index, y);
	return true;
}}"#
    )
}

fn classic_helpers() -> String {
    helpers(
        r#"function _Frostline_regionId(vNode)
{
	var refs = vNode.l;
	if (!refs || !refs.length) { return null; }
	var first = refs[0];
	if (typeof first === "string" && first.indexOf(_Frostline_prefix) === 0) { return first.slice(_Frostline_prefix.length); }
	if (first && first.$ === "FrozenRegion" && typeof first.a === "string") { return first.a; }
	return null;
}"#,
    )
}

fn compact_helpers() -> String {
    let spaced = helpers(
        r#"function _Frostline_regionId(vNode)
{
	var refs = vNode.l;
	if (!refs || !refs.length) { return null; }
	var first = refs[0];
	if (typeof first === "string" && first.indexOf(_Frostline_prefix) === 0) { return first.slice(_Frostline_prefix.length); }
	return null;
}"#,
    );
    spaced
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
