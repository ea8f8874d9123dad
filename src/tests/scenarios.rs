use super::helpers::*;
use crate::{
    decode::{decode_prompt, DecodeOptions},
    PromptError,
};
use std::collections::BTreeSet;
use test_log::test;

const SPEC_TREE: &str = r#"{"a": {"_t": "a", "b": {"c": {"_t": "c"}}}}"#;

#[test]
fn test_missing_paths_contribute_nothing() {
    let doc = json_doc(SPEC_TREE);
    for selector in [
        "nope",
        "nope.deeper",
        "nope.?",
        "nope.*",
        "nope.**",
        "nope.??",
        "nope+none.x",
        "<var>nope</var>",
        "<tag>x.y</tag>",
    ] {
        let out = decode(&doc, selector, 0);
        assert_eq!(out.positive, "", "selector {selector}");
        assert_eq!(out.negative, "", "selector {selector}");
    }
}

#[test]
fn test_nested_tree_paths() {
    let doc = json_doc(SPEC_TREE);
    assert_eq!(decode(&doc, "a.b.c", 0).positive, "a,c");
    assert_eq!(decode(&doc, "a.**", 0).positive, "a,c");
    for seed in 0..8 {
        assert_eq!(decode(&doc, "a.?.c", seed).positive, "a,c");
        assert_eq!(decode(&doc, "a.??", seed).positive, "a,c");
    }
}

#[test]
fn test_retention_never_keeps_zero_probability_child() {
    let doc = toml_doc("[a]\n_r = [1.0, 0.0]\nx = \"first\"\ny = \"second\"\n");
    for seed in 0..32 {
        assert_eq!(decode(&doc, "a.*!", seed).positive, "first");
    }
}

#[test]
fn test_retention_lines_up_with_eligible_children() {
    let doc = toml_doc(
        r#"
flag = "F"

[a]
_r = [1.0, 0.0]
x = { _t = "X", _when = "flag" }
y = "Y"
z = "Z"
"#,
    );
    for seed in 0..16 {
        assert_eq!(decode(&doc, "a.*!", seed).positive, "Y", "seed {seed}");
    }
    // Once the gate is open, `x` takes the first slot again and `z` falls back to 1.0.
    assert_eq!(decode(&doc, "flag, a.*!", 0).positive, "F,X,Z");
}

#[test]
fn test_retention_applies_per_level_under_all_recursive() {
    let doc = toml_doc(
        r#"
[pool]
_r = [0.0, 1.0, 1.0]
skip = "skip"
keep = "keep"

[pool.deep]
_r = [1.0, 0.0]
inner = "inner"
outer = "outer"
"#,
    );
    for seed in 0..16 {
        assert_eq!(decode(&doc, "pool.**", seed).positive, "keep,inner", "seed {seed}");
    }
}

#[test]
fn test_all_children_fan_out() {
    let doc = toml_doc(
        r#"
[outfit]
hat = "straw hat"
shoes = ["boots", "boots"]

[outfit.top]
_t = "top"
color = "red"
"#,
    );
    assert_eq!(decode(&doc, "outfit.*", 0).positive, "straw hat,boots");
    assert_eq!(decode(&doc, "outfit.*$", 0).positive, "straw hat,boots");
    assert_eq!(decode(&doc, "outfit.*!", 0).positive, "straw hat,boots,top");
    assert_eq!(decode(&doc, "outfit.*.color", 0).positive, "top,red");
}

#[test]
fn test_case_emits_first_matching_branch_only() {
    let doc = toml_doc("x = \"x\"\ny = \"y\"\n[pick]\n_t = \"picked\"\n");
    let selector = "x, y\n<case><when key=y><tag>pick</tag></when><when key=x>second</when><else>none</else></case>";
    let out = decode(&doc, selector, 0);
    assert_eq!(out.positive, "x,y,picked");
}

#[test]
fn test_templates_reference_relative_and_absolute_paths() {
    let doc = toml_doc(
        r#"
[char]
_t = "with $hair hair, %outfit"
hair = ["red", "red"]
outfit = "armor"

[style]
_t = "in $::char.hair tones"
"#,
    );
    let out = decode(&doc, "char, style", 0);
    assert_eq!(out.positive, "with red hair,armor,in red tones");
}

#[test]
fn test_template_markup_reaches_negative() {
    let doc = toml_doc("[style]\n_t = \"sharp <neg>blurry</neg>\"\n");
    let out = decode(&doc, "style", 0);
    assert_eq!(out.positive, "sharp");
    assert_eq!(out.negative, "blurry");
}

#[test]
fn test_template_comments_and_choices() {
    let doc = toml_doc("[mood]\n_t = \"{calm|calm} sea // note\"\n");
    assert_eq!(decode(&doc, "mood", 5).positive, "calm sea");
}

#[test]
fn test_deferred_post_follows_its_selector_key() {
    let doc = toml_doc(
        r#"
[scene]
_t = "scene"
[scene._post]
light = "rim light"
[other]
_t = "other"
"#,
    );
    assert_eq!(decode(&doc, "scene, other", 0).positive, "scene,rim light,other");
}

#[test]
fn test_all_and_one_branches_follow_in_order() {
    let doc = toml_doc(
        r#"
[s]
_t = "s"
_post = "tail"

[s._all]
a = "A"
b = "B"

[s._one]
c = "C"
d = "D"
"#,
    );
    let mut seen = BTreeSet::new();
    for seed in 0..32 {
        let out = decode(&doc, "s", seed);
        assert!(
            out.positive == "s,tail,A,B,C" || out.positive == "s,tail,A,B,D",
            "unexpected positive {:?}",
            out.positive
        );
        assert_eq!(out.positive, decode(&doc, "s", seed).positive);
        seen.insert(out.positive);
    }
    assert_eq!(seen.len(), 2);
}

#[test]
fn test_post_order_inserts_into_queue() {
    let doc = toml_doc(
        r#"
[scene.a]
_t = "a"
[scene.a._post]
x = "post a"

[scene.b]
_t = "b"
[scene.b._post]
_order = 0
x = "post b"

[scene.c]
_t = "c"
[scene.c._post]
_order = -1
x = "post c"
"#,
    );
    assert_eq!(
        decode(&doc, "scene.*!", 0).positive,
        "a,b,c,post b,post c,post a"
    );
}

#[test]
fn test_legacy_variables_from_local_and_root_tables() {
    let doc = toml_doc(
        r#"
[_v]
light = "soft light"

[char]
_t = "${hair} hair, ${.light}"
tone = "${hair} tone"

[char._v]
hair = ["red"]
"#,
    );
    assert_eq!(decode(&doc, "char", 0).positive, "red hair,soft light");
    assert_eq!(decode(&doc, "char.tone", 0).positive, "red hair,soft light,red tone");
}

#[test]
fn test_legacy_variables_missing_and_malformed() {
    let doc = toml_doc("[m]\n_t = \"plain ${nope}${.gone}\"\n");
    assert_eq!(decode(&doc, "m", 0).positive, "plain");

    let doc = toml_doc("[b]\n_t = \"${bad}\"\n[b._v.bad]\nk = \"v\"\n");
    let result = decode_prompt(doc, "b", 0, DecodeOptions::default());
    assert!(matches!(result, Err(PromptError::Instruction(_))));
}

#[test]
fn test_duplicate_leaves_repeat_branches_do_not() {
    let doc = toml_doc("leaf = \"l\"\n[br]\n_t = \"b\"\nx = \"x\"\n");
    assert_eq!(decode(&doc, "leaf, leaf, br, br", 0).positive, "l,l,b");
}

#[test]
fn test_route_instruction_pins_random_pick() {
    let doc = toml_doc("[pose]\nstand = \"standing\"\nsit = \"sitting\"\nlie = \"lying\"\n");
    for seed in 0..16 {
        let out = decode(&doc, "<?route \"fix\" \"pose\" \"sit\">\npose.?", seed);
        assert_eq!(out.positive, "sitting");
    }
}

#[test]
fn test_route_does_not_leak_between_runs() {
    let doc = toml_doc("[pose]\nstand = \"standing\"\nsit = \"sitting\"\n");
    decode(&doc, "<?route \"remove\" \"pose\" \"sit\">", 0);
    let seen = (0..32)
        .map(|seed| decode(&doc, "pose.?", seed).positive)
        .collect::<BTreeSet<String>>();
    assert!(seen.contains("sitting"));
}

#[test]
fn test_lora_fragment_and_gate() {
    let doc = toml_doc("[\"<lora>\"]\nfilm = \"film grain\"\n");
    let out = decode(&doc, "<lora:film:0.6><when key=film>cinematic</when>", 0);
    assert_eq!(out.positive, "film grain,cinematic");
    assert_eq!(out.lora_list, "<lora:film:0.6>");
}

#[test]
fn test_random_count_keeps_replays_aligned() {
    let doc = toml_doc(
        r#"
[warm]
_t = "{x|y}"
[pick]
_t = "{a|b|c|d|e|f|g|h}"
"#,
    );
    for seed in 0..16 {
        let edited = parse(&doc, "warm\n<?random_count 4>\npick", seed);
        let original = parse(&doc, "<?random_count 4>\npick", seed);
        assert_eq!(edited.positive.last(), original.positive.last(), "seed {seed}");
    }
}

#[test]
fn test_same_seed_same_summary() {
    let doc = toml_doc(
        r#"
_exports = { sampler = "euler" }

[scene]
_t = "{dawn|noon|dusk}, $place"
place = ["forest", "harbor", "desert", "city"]
"#,
    );
    for seed in [0, 1, 42, u64::MAX] {
        let first = decode(&doc, "scene", seed);
        let second = decode(&doc, "scene", seed);
        assert_eq!(first.summary_text(), second.summary_text());
        assert_eq!(first.exports["prompt_seed"], seed.to_string());
        assert_eq!(first.exports["sampler"], "euler");
    }
}
