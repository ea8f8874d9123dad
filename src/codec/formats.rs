use std::path::Path;

use crate::{codec::DocCodec, document::PromptDocument, error::PromptError};

/// TOML prompt files (`.toml`, and `.txt` which is read as TOML).
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlCodec;

impl DocCodec for TomlCodec {
    fn parse(&self, content: &str, root_dir: &Path) -> Result<PromptDocument, PromptError> {
        PromptDocument::from_toml_str(content, root_dir)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlCodec;

impl DocCodec for YamlCodec {
    fn parse(&self, content: &str, root_dir: &Path) -> Result<PromptDocument, PromptError> {
        PromptDocument::from_yaml_str(content, root_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PromptNode;
    use test_log::test;

    const TOML: &str = r#"
[scene]
_t = "a $mood scene"
_w = [1, 2]
mood = ["calm", "stormy"]
time = "dusk"
"#;

    const YAML: &str = r#"
scene:
  _t: a $mood scene
  _w: [1, 2]
  mood: [calm, stormy]
  time: dusk
"#;

    #[test]
    fn test_toml_and_yaml_agree() {
        let root = Path::new("prompts");
        let toml = TomlCodec.parse(TOML, root).unwrap();
        let yaml = YamlCodec.parse(YAML, root).unwrap();
        assert_eq!(toml, yaml);
        assert_eq!(toml.root_dir(), root);
        assert_eq!(
            toml.get(&["scene", "time"]),
            Some(&PromptNode::Leaf("dusk".to_string()))
        );
    }

    #[test]
    fn test_parse_errors_are_serialization_errors() {
        let root = Path::new(".");
        assert!(matches!(
            TomlCodec.parse("[scene", root),
            Err(PromptError::Serialization(_))
        ));
        assert!(matches!(
            YamlCodec.parse("scene: [a, b", root),
            Err(PromptError::Serialization(_))
        ));
    }
}
