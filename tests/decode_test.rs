use tempfile::tempdir;
use test_log::test;
use toml_prompt::{
    codec::{
        summary::{extract_json_path, split_lora_list},
        PromptFile, Summary,
    },
    decode::{decode_prompt, DecodeOptions, DecodeOutput},
};

mod common;

fn decode_file(name: &str, selector: &str, seed: u64) -> DecodeOutput {
    common::init_logging();
    let temp_dir = tempdir().unwrap();
    let prompts = common::create_prompt_set(&temp_dir);
    let doc = PromptFile::open(prompts.join(name)).unwrap().load().unwrap();
    decode_prompt(doc, selector, seed, DecodeOptions::default()).unwrap()
}

const SELECTOR: &str = r#"
// portrait with a film look
character
<lora:film:0.6>
<lora_low:detail:0.3:0.2>
<neg>blurry, lowres</neg>
<?export "steps" "30">
"#;

#[test]
fn test_end_to_end_decode() {
    let out = decode_file("character.toml", SELECTOR, 11);
    assert!(out.positive.starts_with("portrait,"), "{:?}", out.positive);
    assert!(out.positive.ends_with("linen shirt,film grain"), "{:?}", out.positive);
    assert_eq!(out.negative, "blurry,lowres");
    assert_eq!(out.lora_list, "<lora:film:0.6>\n--\n<lora:detail:0.3:0.2>");
    assert_eq!(out.seed, 11);
    let keys = out.exports.keys().map(String::as_str).collect::<Vec<_>>();
    assert_eq!(keys, vec!["prompt_seed", "model", "subject", "steps"]);
}

#[test]
fn test_summary_round_trip() {
    let out = decode_file("character.toml", SELECTOR, 11);
    let text = out.summary_text();
    let read = Summary::decode(&text).unwrap();
    assert_eq!(read.positive, out.positive);
    assert_eq!(read.negative, out.negative);
    assert_eq!(read.lora_list, out.lora_list);
    assert_eq!(read.seed, out.seed);
    assert_eq!(read.encode(), text);

    let (high, low) = split_lora_list(&read.lora_list);
    assert_eq!(high, "<lora:film:0.6>");
    assert_eq!(low, "<lora:detail:0.3:0.2>");

    let json = read.exports_json().unwrap();
    assert_eq!(extract_json_path(&json, "steps", "0").unwrap(), "30");
    assert_eq!(extract_json_path(&json, "prompt_seed", "0").unwrap(), "11");
    assert_eq!(extract_json_path(&json, "cfg", "7").unwrap(), "7");
}

#[test]
fn test_decode_is_reproducible() {
    for seed in [0, 5, 1 << 40] {
        let first = decode_file("scene.yaml", "scene\nbackdrop.?", seed);
        let second = decode_file("scene.yaml", "scene\nbackdrop.?", seed);
        assert_eq!(first, second);
    }
}

#[test]
fn test_inline_choices_can_be_disabled() {
    common::init_logging();
    let temp_dir = tempdir().unwrap();
    let prompts = common::create_prompt_set(&temp_dir);
    let doc = PromptFile::open(prompts.join("scene.yaml")).unwrap().load().unwrap();
    let options = DecodeOptions {
        inline_choices: false,
        ..DecodeOptions::default()
    };
    let out = decode_prompt(doc, "<neg>{a|b}</neg>", 0, options).unwrap();
    assert_eq!(out.negative, "{a|b}");
}
