//! Prompt composition for clinical note generation.

use std::fmt::Write;

use crate::catalog::ResolvedCode;
use crate::seeds::SeedExample;

const OBJECTIVE: &str = r#"### Objective
Write a clinical note for the diagnosis and procedures listed at the end of this message.

## Style Rules

- Follow the formatting and general layout of the example notes when examples are given.
- NEVER include ICD-10-CM or CPT codes in the clinical note.
- NEVER write in a narrative style. The note should read as fragmented clinical documentation,
  not as a continuous story.
- Document the procedures as performed during the encounter.
- Return only the note, with no preamble or commentary.
"#;

/// Builds the completion prompt. Procedures appear in the order given.
pub fn compose(
    diagnosis: &ResolvedCode,
    procedures: &[ResolvedCode],
    examples: &[&SeedExample],
) -> String {
    let mut out = String::with_capacity(OBJECTIVE.len() + 256);
    out.push_str(OBJECTIVE);

    if !examples.is_empty() {
        out.push_str("\n## Examples\n");
        for ex in examples {
            // Writing to a String cannot fail.
            let _ = write!(
                out,
                "\n**Codes**: {}\n\n**Approximate Synonyms**: {}\n\n**Clinical Note**: {}\n",
                ex.codes.trim(),
                ex.synonyms.trim(),
                ex.note.trim()
            );
        }
    }

    out.push_str("\n## Request\n");
    let _ = write!(
        out,
        "\n**Diagnosis**: {} ({})\n\n**Procedures**:\n",
        diagnosis.description, diagnosis.code
    );
    for p in procedures {
        let _ = writeln!(out, "- {} ({})", p.description, p.code);
    }
    out.push_str("\n**Clinical Note**:");
    out
}
