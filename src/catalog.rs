use serde::Serialize;

use crate::engine::LocalModel;

/// One selectable model class: the smallest machine it makes sense on, the
/// HuggingFace repository it is fetched from, and the name shown in the UI.
#[derive(Debug)]
pub struct ModelTier {
    pub min_ram_gb: u64,
    pub source_repo: &'static str,
    pub display_name: &'static str,
}

/// Quantization variant published in the unsloth GGUF repositories.
const QUANT_SUFFIX: &str = "Q4_K_M";

/// Ordered largest-first; the minimums partition the RAM range from 0 up, so
/// the final 0GB entry is satisfiable on any machine.
pub const MODEL_TIERS: &[ModelTier] = &[
    ModelTier { min_ram_gb: 48, source_repo: "unsloth/Qwen3-32B-GGUF", display_name: "Qwen3 32B" },
    ModelTier { min_ram_gb: 32, source_repo: "unsloth/Qwen3-14B-GGUF", display_name: "Qwen3 14B" },
    ModelTier { min_ram_gb: 20, source_repo: "unsloth/Qwen3-8B-GGUF", display_name: "Qwen3 8B" },
    ModelTier { min_ram_gb: 12, source_repo: "unsloth/Qwen3-4B-GGUF", display_name: "Qwen3 4B" },
    ModelTier { min_ram_gb: 8, source_repo: "unsloth/Qwen3-1.7B-GGUF", display_name: "Qwen3 1.7B" },
    ModelTier { min_ram_gb: 0, source_repo: "unsloth/Qwen3-0.6B-GGUF", display_name: "Qwen3 0.6B" },
];

/// A model the current machine could run, whether or not it is on disk yet.
/// `id` is a local file id for downloaded entries and the source repo for
/// entries that still need fetching.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AvailableModel {
    pub id: String,
    pub name: String,
    pub downloaded: bool,
    #[serde(rename = "sourceUri")]
    pub source_uri: Option<String>,
}

fn repo_short_name(source_repo: &str) -> &str {
    source_repo.rsplit('/').next().unwrap_or(source_repo)
}

/// Lower-cased repo name with the conventional `-GGUF` suffix stripped.
/// This is the needle used to decide which tier "owns" a local file — a loose
/// substring heuristic, not a precise key.
pub fn match_needle(source_repo: &str) -> String {
    let short = repo_short_name(source_repo).to_lowercase();
    match short.strip_suffix("-gguf") {
        Some(base) => base.to_string(),
        None => short,
    }
}

/// Filename a tier's download lands under, e.g. `Qwen3-4B-Q4_K_M.gguf`.
pub fn model_file_name(source_repo: &str) -> String {
    let short = repo_short_name(source_repo);
    let base = short.strip_suffix("-GGUF").unwrap_or(short);
    format!("{base}-{QUANT_SUFFIX}.gguf")
}

pub fn download_url(source_repo: &str) -> String {
    format!(
        "https://huggingface.co/{}/resolve/main/{}",
        source_repo,
        model_file_name(source_repo)
    )
}

pub fn smallest_tier() -> &'static ModelTier {
    &MODEL_TIERS[MODEL_TIERS.len() - 1]
}

/// Tiers the given machine qualifies for, smallest memory requirement first.
/// A pathologically low reading still yields one candidate (the smallest
/// tier) so selection always has something to try.
pub fn candidate_tiers(ram_gb: u64) -> Vec<&'static ModelTier> {
    let mut out: Vec<&'static ModelTier> = MODEL_TIERS
        .iter()
        .filter(|t| t.min_ram_gb <= ram_gb)
        .collect();
    out.sort_by_key(|t| t.min_ram_gb);
    if out.is_empty() {
        out.push(smallest_tier());
    }
    out
}

/// Longest-needle-wins ranked match; ties fall back to earlier entries.
/// Generic so collision behavior is testable with synthetic needles.
fn best_match<'a, T>(hay: &str, entries: impl Iterator<Item = (String, &'a T)>) -> Option<&'a T> {
    let hay = hay.to_lowercase();
    let mut best: Option<(&'a T, usize)> = None;
    for (needle, item) in entries {
        if needle.is_empty() || !hay.contains(&needle) {
            continue;
        }
        if best.map(|(_, len)| needle.len() > len).unwrap_or(true) {
            best = Some((item, needle.len()));
        }
    }
    best.map(|(item, _)| item)
}

/// The tier that owns a local file id, regardless of whether the machine can
/// run it. None for files no tier's needle matches.
pub fn tier_for_local_id(id: &str) -> Option<&'static ModelTier> {
    best_match(id, MODEL_TIERS.iter().map(|t| (match_needle(t.source_repo), t)))
}

/// Resolve a user-supplied selector to a tier: exact source repo first, then
/// the same fuzzy ownership match used for local files.
pub fn tier_for_selector(selector: &str) -> Option<&'static ModelTier> {
    if let Some(tier) = MODEL_TIERS.iter().find(|t| t.source_repo == selector) {
        return Some(tier);
    }
    tier_for_local_id(selector)
}

pub fn display_name_for_id(id: &str) -> Option<&'static str> {
    tier_for_local_id(id).map(|t| t.display_name)
}

/// Source repo for an id that is either a raw repo selector or a local file
/// owned by a tier. None when nothing is known about the id.
pub fn source_repo_for_id(id: &str) -> Option<&'static str> {
    tier_for_selector(id).map(|t| t.source_repo)
}

/// First local file a tier owns, if any. Callers pass a sorted listing so the
/// answer is stable across scans.
pub fn local_file_for_tier<'a>(
    locals: &'a [LocalModel],
    tier: &'static ModelTier,
) -> Option<&'a LocalModel> {
    locals
        .iter()
        .find(|m| tier_for_local_id(&m.id).map(|t| std::ptr::eq(t, tier)).unwrap_or(false))
}

/// The model menu for a machine with `ram_gb` of memory: every qualifying
/// tier (joined with its local file when one exists), plus local files no
/// tier claims. Files owned by a tier the machine cannot run are hidden so
/// the menu never offers something the hardware cannot hold.
pub fn available_models(ram_gb: u64, locals: &[LocalModel]) -> Vec<AvailableModel> {
    let mut rows: Vec<AvailableModel> = Vec::new();

    for tier in candidate_tiers(ram_gb) {
        match local_file_for_tier(locals, tier) {
            Some(local) => rows.push(AvailableModel {
                id: local.id.clone(),
                name: tier.display_name.to_string(),
                downloaded: true,
                source_uri: Some(tier.source_repo.to_string()),
            }),
            None => rows.push(AvailableModel {
                id: tier.source_repo.to_string(),
                name: tier.display_name.to_string(),
                downloaded: false,
                source_uri: Some(tier.source_repo.to_string()),
            }),
        }
    }
    // Largest-first for display, matching the tier table.
    rows.reverse();

    for local in locals {
        if tier_for_local_id(&local.id).is_some() {
            continue;
        }
        rows.push(AvailableModel {
            id: local.id.clone(),
            name: local.id.clone(),
            downloaded: true,
            source_uri: None,
        });
    }

    let mut seen = std::collections::HashSet::new();
    rows.retain(|m| seen.insert(m.id.clone()));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn local(id: &str) -> LocalModel {
        LocalModel { id: id.to_string(), path: PathBuf::from(format!("/models/{id}.gguf")) }
    }

    // ── tier table ──

    #[test]
    fn test_tier_table_descends_to_zero() {
        for pair in MODEL_TIERS.windows(2) {
            assert!(pair[0].min_ram_gb > pair[1].min_ram_gb);
        }
        assert_eq!(MODEL_TIERS.last().map(|t| t.min_ram_gb), Some(0));
    }

    #[test]
    fn test_match_needle() {
        assert_eq!(match_needle("unsloth/Qwen3-4B-GGUF"), "qwen3-4b");
        assert_eq!(match_needle("unsloth/Qwen3-0.6B-GGUF"), "qwen3-0.6b");
    }

    #[test]
    fn test_model_file_name_and_url() {
        assert_eq!(model_file_name("unsloth/Qwen3-8B-GGUF"), "Qwen3-8B-Q4_K_M.gguf");
        assert_eq!(
            download_url("unsloth/Qwen3-8B-GGUF"),
            "https://huggingface.co/unsloth/Qwen3-8B-GGUF/resolve/main/Qwen3-8B-Q4_K_M.gguf"
        );
    }

    // ── candidate ordering ──

    #[test]
    fn test_candidate_tiers_ascending() {
        let tiers = candidate_tiers(14);
        let mins: Vec<u64> = tiers.iter().map(|t| t.min_ram_gb).collect();
        assert_eq!(mins, vec![0, 8, 12]);
    }

    #[test]
    fn test_candidate_tiers_never_empty() {
        assert_eq!(candidate_tiers(64).len(), MODEL_TIERS.len());
        let zero = candidate_tiers(0);
        assert_eq!(zero.len(), 1);
        assert_eq!(zero[0].min_ram_gb, 0);
    }

    // ── fuzzy ownership ──

    #[test]
    fn test_tier_for_local_id_matches_downloaded_file() {
        let tier = tier_for_local_id("Qwen3-4B-Q4_K_M").expect("owned");
        assert_eq!(tier.display_name, "Qwen3 4B");
        let tier = tier_for_local_id("qwen3-14b-q4_k_m").expect("owned");
        assert_eq!(tier.display_name, "Qwen3 14B");
    }

    #[test]
    fn test_tier_for_local_id_unowned() {
        assert!(tier_for_local_id("Mistral-7B-Instruct-v0.3.Q4_K_M").is_none());
        assert!(tier_for_local_id("").is_none());
    }

    #[test]
    fn test_best_match_prefers_longest_needle() {
        let a = "first";
        let b = "second";
        let entries = vec![("llama-3".to_string(), &a), ("llama-3.1".to_string(), &b)];
        let hit = best_match("Llama-3.1-8B-Instruct", entries.iter().map(|(n, i)| (n.clone(), *i)));
        assert_eq!(hit, Some(&b));
    }

    #[test]
    fn test_best_match_tie_keeps_table_order() {
        let a = "first";
        let b = "second";
        let entries = vec![("phi-4".to_string(), &a), ("phi-4".to_string(), &b)];
        let hit = best_match("phi-4-mini", entries.iter().map(|(n, i)| (n.clone(), *i)));
        assert_eq!(hit, Some(&a));
    }

    #[test]
    fn test_source_repo_for_id() {
        assert_eq!(source_repo_for_id("unsloth/Qwen3-8B-GGUF"), Some("unsloth/Qwen3-8B-GGUF"));
        assert_eq!(source_repo_for_id("Qwen3-8B-Q4_K_M"), Some("unsloth/Qwen3-8B-GGUF"));
        assert_eq!(source_repo_for_id("not-a-real-model"), None);
    }

    #[test]
    fn test_tier_for_selector() {
        assert!(tier_for_selector("unsloth/Qwen3-8B-GGUF").is_some());
        assert!(tier_for_selector("Qwen3-8B-Q4_K_M").is_some());
        assert!(tier_for_selector("not-a-real-model").is_none());
    }

    // ── availability view ──

    #[test]
    fn test_available_never_exceeds_ram() {
        for ram in [0u64, 4, 8, 14, 20, 31, 48, 96] {
            for model in available_models(ram, &[]) {
                if let Some(uri) = &model.source_uri {
                    let tier = MODEL_TIERS.iter().find(|t| t.source_repo == *uri).unwrap();
                    assert!(tier.min_ram_gb <= ram, "ram={ram} listed {}", model.name);
                }
            }
        }
    }

    #[test]
    fn test_available_never_empty() {
        for ram in [0u64, 1, 8, 14, 128] {
            assert!(!available_models(ram, &[]).is_empty(), "ram={ram}");
        }
    }

    #[test]
    fn test_available_joins_local_file() {
        let locals = vec![local("Qwen3-4B-Q4_K_M")];
        let rows = available_models(14, &locals);
        let four_b = rows.iter().find(|m| m.name == "Qwen3 4B").unwrap();
        assert!(four_b.downloaded);
        assert_eq!(four_b.id, "Qwen3-4B-Q4_K_M");
        // Undownloaded qualifying tiers keep their repo as the id.
        let small = rows.iter().find(|m| m.name == "Qwen3 0.6B").unwrap();
        assert!(!small.downloaded);
        assert_eq!(small.id, "unsloth/Qwen3-0.6B-GGUF");
    }

    #[test]
    fn test_available_hides_oversized_tier_even_when_downloaded() {
        // A 14B file needs a 32GB machine; on 14GB it must not show up.
        let locals = vec![local("Qwen3-14B-Q4_K_M")];
        let rows = available_models(14, &locals);
        assert!(rows.iter().all(|m| m.id != "Qwen3-14B-Q4_K_M"));
        assert!(rows.iter().all(|m| m.name != "Qwen3 14B"));
    }

    #[test]
    fn test_available_includes_unclaimed_local_file() {
        let locals = vec![local("Mistral-7B-Instruct-v0.3.Q4_K_M")];
        let rows = available_models(14, &locals);
        let stray = rows.iter().find(|m| m.id.starts_with("Mistral")).unwrap();
        assert!(stray.downloaded);
        assert_eq!(stray.source_uri, None);
    }

    #[test]
    fn test_available_display_order_largest_first() {
        let rows = available_models(14, &[]);
        let names: Vec<&str> = rows.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Qwen3 4B", "Qwen3 1.7B", "Qwen3 0.6B"]);
    }
}
