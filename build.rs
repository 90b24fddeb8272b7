//! Source policy checks for `src/` and `tests/`. Any violating line fails the
//! build and is printed with its line number.

use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories holding the crate's own sources. Nothing else under the
/// manifest directory is scanned.
const SOURCE_ROOTS: [&str; 2] = ["src", "tests"];

/// One policy: lines matching `pattern` are violations when `keep` accepts them.
struct Rule {
    what: &'static str,
    pattern: &'static str,
    keep: fn(&str) -> bool,
    advice: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        what: "underscore-prefixed names",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        keep: underscore_outside_strings,
        advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
    },
    Rule {
        what: "comments with edit-history words",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        keep: always,
        advice: "Comments describe the code as it is, not how it got there. Remove them.",
    },
    Rule {
        what: "'**' in non-doc comments",
        pattern: r"(//|/\*).*\*\*",
        keep: not_doc_comment,
        advice: "Markdown emphasis is only allowed in `///` doc comments.",
    },
    Rule {
        what: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        keep: all_caps_comment,
        advice: "Comments whose letters are all uppercase are not allowed. Consider deleting them.",
    },
    Rule {
        what: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        keep: always,
        advice: "Use the code or delete it instead of silencing the lint.",
    },
];

/// Collects the matched lines of one file that the rule keeps.
struct LineCollector {
    keep: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.keep)(line) {
            let number = mat.line_number().unwrap_or(0);
            self.violations.push(format!("{number}:{line}"));
        }
        Ok(true)
    }
}

fn always(_: &str) -> bool {
    true
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn not_doc_comment(line: &str) -> bool {
    !line.trim_start().starts_with("///")
}

// Odd-numbered segments between double quotes are string contents.
fn underscore_outside_strings(line: &str) -> bool {
    let in_string = line
        .split('"')
        .skip(1)
        .step_by(2)
        .any(|part| part.contains('_'));
    !is_comment(line) && !in_string
}

fn all_caps_comment(line: &str) -> bool {
    let text = if let Some(rest) = line.trim_start().strip_prefix("//") {
        rest.trim_start_matches('/')
    } else if let Some(start) = line.find("/*") {
        let rest = &line[start + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn report(rule: &Rule, path: &Path, violations: &[String]) -> String {
    let mut msg = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        rule.what,
        path.display()
    );
    for violation in violations {
        msg.push_str(&format!("   {violation}\n"));
    }
    msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
    msg
}

fn check_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in rust_sources() {
            let mut collector = LineCollector {
                keep: rule.keep,
                violations: Vec::new(),
            };
            searcher.search_path(&matcher, &path, &mut collector)?;
            if !collector.violations.is_empty() {
                return Err(report(rule, &path, &collector.violations).into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    // `eprintln!` is what shows up in cargo's output.
    if let Err(e) = check_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
