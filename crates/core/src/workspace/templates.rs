//! Starter layouts for new workspaces.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Python,
    Node,
    Rust,
    Go,
    Java,
    #[default]
    Generic,
}

impl Template {
    pub const ALL: [Template; 6] = [
        Template::Python,
        Template::Node,
        Template::Rust,
        Template::Go,
        Template::Java,
        Template::Generic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Template::Python => "python",
            Template::Node => "node",
            Template::Rust => "rust",
            Template::Go => "go",
            Template::Java => "java",
            Template::Generic => "generic",
        }
    }

    /// Starter files as `(relative path, content)`.
    pub fn files(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Template::Python => &[
                ("requirements.txt", ""),
                ("main.py", "def main():\n    print(\"Hello from the workspace\")\n\n\nif __name__ == \"__main__\":\n    main()\n"),
                ("tests/__init__.py", ""),
                ("tests/test_main.py", "from main import main\n\n\ndef test_main(capsys):\n    main()\n    assert \"Hello\" in capsys.readouterr().out\n"),
                (".gitignore", "__pycache__/\n*.pyc\n.venv/\n"),
            ],
            Template::Node => &[
                ("package.json", "{\n  \"name\": \"workspace\",\n  \"version\": \"0.1.0\",\n  \"private\": true,\n  \"scripts\": {\n    \"start\": \"node index.js\",\n    \"test\": \"node --test\"\n  }\n}\n"),
                ("index.js", "console.log(\"Hello from the workspace\");\n"),
                (".gitignore", "node_modules/\n"),
            ],
            Template::Rust => &[
                ("Cargo.toml", "[package]\nname = \"workspace\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[dependencies]\n"),
                ("src/main.rs", "fn main() {\n    println!(\"Hello from the workspace\");\n}\n"),
                (".gitignore", "/target\n"),
            ],
            Template::Go => &[
                ("go.mod", "module workspace\n\ngo 1.21\n"),
                ("main.go", "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"Hello from the workspace\")\n}\n"),
            ],
            Template::Java => &[
                ("src/main/java/Main.java", "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello from the workspace\");\n    }\n}\n"),
                (".gitignore", "*.class\ntarget/\n"),
            ],
            Template::Generic => &[("README.md", "# Workspace\n")],
        }
    }

    /// Best guess from the manifests present in `root`.
    pub fn detect(root: &Path) -> Template {
        let markers: [(&str, Template); 6] = [
            ("Cargo.toml", Template::Rust),
            ("package.json", Template::Node),
            ("go.mod", Template::Go),
            ("requirements.txt", Template::Python),
            ("pyproject.toml", Template::Python),
            ("src/main/java", Template::Java),
        ];
        markers
            .into_iter()
            .find(|(marker, _)| root.join(marker).exists())
            .map(|(_, template)| template)
            .unwrap_or_default()
    }

    /// Setup commands used when the caller supplies none. Each only applies
    /// when its manifest is present in `root`.
    pub fn default_setup_commands(&self, root: &Path) -> Vec<String> {
        let candidates: &[(&str, &str)] = match self {
            Template::Python => &[(
                "requirements.txt",
                "python3 -m pip install -r requirements.txt",
            )],
            Template::Node => &[
                ("package.json", "npm install --ignore-scripts"),
                ("package.json", "npm audit"),
            ],
            Template::Rust => &[("Cargo.toml", "cargo fetch")],
            Template::Go => &[("go.mod", "go mod download")],
            Template::Java | Template::Generic => &[],
        };
        candidates
            .iter()
            .filter(|(manifest, _)| root.join(manifest).is_file())
            .map(|(_, command)| command.to_string())
            .collect()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Template {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let alias = match wanted.as_str() {
            "javascript" | "nodejs" | "typescript" => "node",
            "py" | "python3" => "python",
            "golang" => "go",
            other => other,
        };
        Template::ALL
            .into_iter()
            .find(|t| t.name() == alias)
            .ok_or_else(|| SandboxError::Config {
                message: format!(
                    "unknown workspace template '{}' (expected one of: {})",
                    s,
                    Template::ALL.map(|t| t.name()).join(", ")
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("python".parse::<Template>().unwrap(), Template::Python);
        assert_eq!("NodeJS".parse::<Template>().unwrap(), Template::Node);
        assert_eq!("golang".parse::<Template>().unwrap(), Template::Go);
        assert!("cobol".parse::<Template>().is_err());
    }

    #[test]
    fn setup_commands_follow_manifests() {
        let dir = TempDir::new().unwrap();
        assert!(Template::Node.default_setup_commands(dir.path()).is_empty());
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(
            Template::Node.default_setup_commands(dir.path()),
            vec!["npm install --ignore-scripts", "npm audit"]
        );
        assert!(Template::Generic.default_setup_commands(dir.path()).is_empty());
    }

    #[test]
    fn detect_reads_manifests() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Template::detect(dir.path()), Template::Generic);
        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert_eq!(Template::detect(dir.path()), Template::Go);
    }
}
