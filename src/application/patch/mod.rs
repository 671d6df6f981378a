//! Static-region adoption for the client virtual-DOM engine.
//!
//! Rewrites the engine's compiled source so deferred nodes carrying a region
//! id adopt the DOM already on the page, skip re-evaluation when the id is
//! unchanged, and swap in registry markup when navigation changes the id.

mod rules;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

pub use rules::{EngineVariant, Rule, rules};

/// Prefix marking a deferred node's first ref as a region id.
pub const REGION_PREFIX: &str = "__FROZEN_REGION__:";
/// Global the host fills with region markup before a navigation diff.
pub const REGISTRY_GLOBAL: &str = "__frostlineRegions";

const PATCH_MARKER: &str = "_Frostline_diffThunk";

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("no supported virtual-DOM engine found in source")]
    UnknownVariant,
    #[error("source is already patched")]
    AlreadyPatched,
    #[error("{variant} rule `{rule}` matched {found} site(s), expected at least {expected}")]
    MissingSites {
        variant: &'static str,
        rule: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("rule `{rule}` has an invalid pattern: {source}")]
    Pattern {
        rule: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub variant: EngineVariant,
    pub source: String,
    /// Rule name and number of sites rewritten, in application order.
    pub sites: Vec<(&'static str, usize)>,
}

pub fn detect(source: &str) -> Result<EngineVariant, PatchError> {
    let classic = compile("detect-classic", rules::CLASSIC_DIFF_SIGNATURE)?;
    if classic.is_match(source) {
        return Ok(EngineVariant::Classic);
    }
    let compact = compile("detect-compact", rules::COMPACT_DIFF_SIGNATURE)?;
    if compact.is_match(source) {
        return Ok(EngineVariant::Compact);
    }
    Err(PatchError::UnknownVariant)
}

/// Patch `source`, or fail without returning partially patched text.
pub fn patch(source: &str) -> Result<Patched, PatchError> {
    if source.contains(PATCH_MARKER) {
        return Err(PatchError::AlreadyPatched);
    }
    let variant = detect(source)?;

    let compiled = rules(variant)
        .iter()
        .map(|rule| compile(rule.name, rule.pattern).map(|regex| (rule, regex)))
        .collect::<Result<Vec<_>, _>>()?;

    for (rule, regex) in &compiled {
        let found = regex.find_iter(source).count();
        if found < rule.required {
            return Err(PatchError::MissingSites {
                variant: variant.as_str(),
                rule: rule.name,
                expected: rule.required,
                found,
            });
        }
    }

    let mut patched = source.to_string();
    let mut sites = Vec::with_capacity(compiled.len());
    for (rule, regex) in &compiled {
        let found = regex.find_iter(&patched).count();
        patched = regex
            .replace_all(&patched, |caps: &regex::Captures<'_>| (rule.rewrite)(caps))
            .into_owned();
        debug!(
            target = "application::patch",
            variant = variant.as_str(),
            rule = rule.name,
            sites = found,
            "Applied rewrite rule"
        );
        sites.push((rule.name, found));
    }

    info!(
        target = "application::patch",
        op = "patch",
        variant = variant.as_str(),
        result = "ok",
        "Virtual-DOM engine patched for region adoption"
    );
    Ok(Patched {
        variant,
        source: patched,
        sites,
    })
}

fn compile(rule: &'static str, pattern: &str) -> Result<Regex, PatchError> {
    Regex::new(pattern).map_err(|source| PatchError::Pattern { rule, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC_SOURCE: &str = r#"function _VirtualDom_render(vNode, eventNode)
{
	var tag = vNode.$;

	if (tag === 5)
	{
		return _VirtualDom_render(vNode.k || (vNode.k = vNode.m()), eventNode);
	}

	if (tag === 0)
	{
		return _VirtualDom_doc.createTextNode(vNode.a);
	}
}

function _VirtualDom_diffHelp(x, y, patches, index)
{
	if (x === y)
	{
		return;
	}

	switch (yType)
	{
		case 5:
			var xRefs = x.l;
			var yRefs = y.l;
			var i = xRefs.length;
	}
}
"#;

    fn compact_source() -> String {
        concat!(
            "function _VirtualDom_render(vNode,eventNode){var tag=vNode.$;",
            "if(tag===5){return _VirtualDom_render(vNode.k||(vNode.k=vNode.m()),eventNode);}",
            "if(tag===0){return _VirtualDom_doc.createTextNode(vNode.a);}}",
            "function _VirtualDom_diffHelp(x,y,patches,index){if(x===y){return;}",
            "switch(yType){case 5:var xRefs=x.l;var yRefs=y.l;var i=xRefs.length;}}"
        )
        .to_string()
    }

    #[test]
    fn detects_both_engine_variants() {
        assert_eq!(detect(CLASSIC_SOURCE).expect("classic"), EngineVariant::Classic);
        assert_eq!(detect(&compact_source()).expect("compact"), EngineVariant::Compact);
        assert!(matches!(detect("var x = 1;"), Err(PatchError::UnknownVariant)));
    }

    #[test]
    fn classic_source_gets_every_rewrite() {
        let patched = patch(CLASSIC_SOURCE).expect("patched");
        assert_eq!(patched.variant, EngineVariant::Classic);
        assert!(patched.sites.iter().all(|(_, count)| *count == 1));
        assert!(patched.source.contains("var __frostlineDom = _Frostline_adopt(vNode);"));
        assert!(
            patched
                .source
                .contains("if (_Frostline_diffThunk(x, y, patches, index)) { return; }")
        );
        assert!(patched.source.contains(REGION_PREFIX));
        assert!(patched.source.contains(REGISTRY_GLOBAL));
        assert!(patched.source.contains("\"FrozenRegion\""));

        let helpers = patched.source.find("function _Frostline_adopt").expect("helpers");
        let diff = patched
            .source
            .find("function _VirtualDom_diffHelp")
            .expect("diff");
        assert!(helpers < diff);
    }

    #[test]
    fn compact_source_uses_prefix_detection_only() {
        let patched = patch(&compact_source()).expect("patched");
        assert_eq!(patched.variant, EngineVariant::Compact);
        assert!(patched.source.contains("case 5:if(_Frostline_diffThunk(x,y,patches,index)){return;}"));
        assert!(patched.source.contains("var __frostlineDom=_Frostline_adopt(vNode);"));
        assert!(!patched.source.contains("\"FrozenRegion\""));
    }

    #[test]
    fn missing_sites_fail_loudly() {
        let without_sites = CLASSIC_SOURCE
            .replace("case 5:", "case 6:")
            .replace("if (tag === 5)", "if (tag === 6)");
        let err = patch(&without_sites).expect_err("missing sites");
        assert!(matches!(
            err,
            PatchError::MissingSites {
                variant: "classic",
                found: 0,
                expected: 1,
                ..
            }
        ));
    }

    #[test]
    fn refuses_to_patch_twice() {
        let once = patch(CLASSIC_SOURCE).expect("patched");
        assert!(matches!(patch(&once.source), Err(PatchError::AlreadyPatched)));
    }
}
