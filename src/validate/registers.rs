//! Register-offset validation code generation.
//!
//! The headers and the register database are produced by two independent
//! generators; this cross-checks them. For every known register we emit
//! a static-assertion-style check that the struct field's byte offset
//! matches the documented address offset, and append the whole block to
//! the first staged source so the compiler evaluates it during the
//! normal build.
//!
//! Documentation names and header spellings drift: arrays collapse
//! (`AFR3` becomes `AFR[3]`), wide registers split (`CNTH`/`CNTL`).
//! Rename rules translate the documented name into the header field;
//! a blocklist suppresses registers known to be absent or renamed
//! beyond repair.

use crate::bsp::RegisterDatabase;
use crate::job::RenameRule;
use anyhow::{Context, Result};
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub struct RenameRules {
    rules: Vec<(Regex, String)>,
}

impl RenameRules {
    pub fn compile(rules: &[RenameRule]) -> Result<RenameRules> {
        let mut compiled = Vec::new();
        for rule in rules {
            let re = Regex::new(&rule.find)
                .with_context(|| format!("Invalid register rename regex '{}'", rule.find))?;
            compiled.push((re, rule.replace.clone()));
        }
        Ok(RenameRules { rules: compiled })
    }

    /// Translate a documented register name to its header spelling. The
    /// first matching rule wins; capture groups are available as `$1`…
    pub fn apply(&self, name: &str) -> String {
        for (re, replacement) in &self.rules {
            if re.is_match(name) {
                return re.replace(name, replacement.as_str()).into_owned();
            }
        }
        name.to_string()
    }
}

pub struct Blocklist {
    patterns: Vec<Regex>,
}

impl Blocklist {
    pub fn compile(patterns: &[String]) -> Result<Blocklist> {
        let mut compiled = Vec::new();
        for p in patterns {
            compiled.push(
                Regex::new(p)
                    .with_context(|| format!("Invalid non-validated-register regex '{}'", p))?,
            );
        }
        Ok(Blocklist { patterns: compiled })
    }

    /// Matched against both the bare register name and `SET.REGISTER`.
    pub fn is_blocked(&self, set: &str, register: &str) -> bool {
        let qualified = format!("{}.{}", set, register);
        self.patterns
            .iter()
            .any(|re| re.is_match(register) || re.is_match(&qualified))
    }
}

/// Generate the verification function. One block-scoped typedef per
/// register; a negative array size fails the build when an offset
/// disagrees.
pub fn generate_assertions(
    db: &RegisterDatabase,
    renames: &RenameRules,
    blocklist: &Blocklist,
) -> String {
    let mut code = String::from(
        "\n\n/* Auto-generated register layout checks. */\n\
         #include <stddef.h>\n\
         static void __attribute__((unused)) register_offset_checks(void)\n{\n",
    );
    let mut n = 0usize;
    for (set_name, set) in &db.sets {
        for (reg_name, &offset) in &set.registers {
            if blocklist.is_blocked(set_name, reg_name) {
                continue;
            }
            let field = renames.apply(reg_name);
            code.push_str(&format!(
                "    /* {}.{} */ {{ typedef char check_{}[(offsetof({}, {}) == 0x{:X}) ? 1 : -1]; }}\n",
                set_name, reg_name, n, set.struct_name, field, offset
            ));
            n += 1;
        }
    }
    code.push_str("}\n");
    code
}

/// Append the generated block to a staged source file.
pub fn inject_into(source: &Path, code: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(source)
        .with_context(|| format!("Failed to open {} for injection", source.display()))?;
    file.write_all(code.as_bytes())
        .with_context(|| format!("Failed to append register checks to {}", source.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> RegisterDatabase {
        serde_json::from_str(
            r#"{ "sets": {
                "GPIOA": {
                    "struct_name": "GPIO_TypeDef",
                    "registers": { "MODER": 0, "AFR3": 36, "RESERVED0": 48 }
                },
                "TIM2": {
                    "struct_name": "TIM_TypeDef",
                    "registers": { "CNTH": 40, "CNTL": 44 }
                }
            } }"#,
        )
        .unwrap()
    }

    fn rules() -> RenameRules {
        RenameRules::compile(&[
            RenameRule {
                find: r"^AFR(\d+)$".to_string(),
                replace: "AFR[$1]".to_string(),
            },
            RenameRule {
                find: r"^CNT(H|L)$".to_string(),
                replace: "CNT.$1".to_string(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_rename_rule_array_index() {
        assert_eq!(rules().apply("AFR3"), "AFR[3]");
        assert_eq!(rules().apply("MODER"), "MODER");
    }

    #[test]
    fn test_rename_rule_high_low_split() {
        assert_eq!(rules().apply("CNTH"), "CNT.H");
        assert_eq!(rules().apply("CNTL"), "CNT.L");
    }

    #[test]
    fn test_blocklist_matches_bare_and_qualified_names() {
        let bl = Blocklist::compile(&["^RESERVED".to_string(), "^TIM2\\.CNTL$".to_string()])
            .unwrap();
        assert!(bl.is_blocked("GPIOA", "RESERVED0"));
        assert!(bl.is_blocked("TIM2", "CNTL"));
        assert!(!bl.is_blocked("TIM2", "CNTH"));
    }

    #[test]
    fn test_generated_assertions_shape() {
        let bl = Blocklist::compile(&["^RESERVED".to_string()]).unwrap();
        let code = generate_assertions(&sample_db(), &rules(), &bl);

        assert!(code.contains("offsetof(GPIO_TypeDef, MODER) == 0x0"));
        assert!(code.contains("offsetof(GPIO_TypeDef, AFR[3]) == 0x24"));
        assert!(code.contains("offsetof(TIM_TypeDef, CNT.H) == 0x28"));
        // Blocked register is absent.
        assert!(!code.contains("RESERVED0 */"));
        // One balanced function.
        assert!(code.contains("register_offset_checks(void)"));
        assert_eq!(code.matches("typedef char").count(), 4);
    }

    #[test]
    fn test_inject_appends_to_source() {
        let dir = std::env::temp_dir().join("bspcheck_registers_inject");
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("main.c");
        std::fs::write(&src, "int main(void) { return 0; }\n").unwrap();

        inject_into(&src, "\n/* appended */\n").unwrap();
        let text = std::fs::read_to_string(&src).unwrap();
        assert!(text.starts_with("int main"));
        assert!(text.ends_with("/* appended */\n"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_rename_regex_is_a_configuration_error() {
        let err = RenameRules::compile(&[RenameRule {
            find: "(".to_string(),
            replace: "x".to_string(),
        }]);
        assert!(err.is_err());
    }
}
