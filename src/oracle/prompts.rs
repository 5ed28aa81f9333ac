pub const SIMILARITY_BATCH_SYSTEM: &str = r#"You compare pairs of code-change themes from a single pull request and decide whether each pair describes the same change.

For every pair you receive, return one verdict in the same order as the input:
- combined_score: 0.0 to 1.0, how likely the two themes describe the same underlying change
- name_score: 0.0 to 1.0, similarity of the names alone
- file_score: 0.0 to 1.0, overlap of the touched files and code
- should_merge: true only when a reviewer would see the two as one change
- reasoning: one short sentence

SCORING GUIDE:
- 0.95+: the same change described twice (same files, same purpose)
- 0.7-0.95: one change seen from two angles; merging loses nothing
- 0.3-0.7: related work that a reviewer would still read separately
- below 0.3: different changes

Adding something and removing something are never the same change, even in the same file.
Return exactly one verdict per pair, in input order. Never skip a pair."#;

pub const DOMAIN_CLASSIFY_SYSTEM: &str = r#"You group code-change themes by the business domain they serve.

For every theme you receive, return one classification in the same order as the input:
- domain: a short Title Case label (2-4 words), e.g. "User Authentication", "Payment Processing", "Build & Infrastructure"
- confidence: 0.0 to 1.0

RULES:
- Reuse the same label for themes that belong together; consistency matters more than precision
- Prefer business-facing labels over technical layer names
- Use "General Changes" only when nothing else fits
- Return exactly one classification per theme, in input order"#;

pub const EXPANSION_SYSTEM: &str = r#"You decide whether a code-change theme should be broken down into smaller sub-themes for a reviewer who drills down from the big picture to individual lines.

A theme is ATOMIC when it is one coherent change a reviewer can understand in a single pass: one function, one small fix, one configuration tweak. Atomic themes must not be expanded.

When a theme bundles several distinct changes, expand it into children. Each child must:
- have a clear name and a one-sentence description
- state its business_value and technical_purpose
- claim its code through assigned_code entries: {"file", "start_line", "end_line"}

PARTITION RULES (your answer is rejected if any rule is broken):
- Only use files listed for the parent theme
- Only use line ranges inside the parent's code blocks
- Every line of the parent's code must be claimed by exactly one child
- No two children may claim the same line
- A file listed without code blocks must be claimed whole: set start_line and end_line to null
- At least two children; never a single child that restates the parent

Return should_expand=false and is_atomic=true with no children when the theme is already atomic."#;

pub const DUPLICATES_SYSTEM: &str = r#"You find true duplicates among sibling code-change themes.

Two themes are duplicates only when they touch the same code for the same purpose. Themes that are merely related, share a file, or belong to the same feature are NOT duplicates.

Return groups of indices (0-based, as numbered in the input). Each group has at least two members and a short reasoning. Every index appears in at most one group. Return an empty list when there are no duplicates. When in doubt, leave themes separate."#;

pub const GROUP_SUMMARY_SYSTEM: &str = r#"You write one unified name and description for a set of code-change themes that are being combined.

- name: under 60 characters, describes what changed, starts with a verb when it fits ("Add", "Fix", "Refactor")
- description: 1-2 sentences covering everything the combined themes do

When a domain is given, the themes are children of a new parent for that domain: the name should summarize the domain's changes as a whole, not any single child.

Do not invent work that none of the themes describe."#;

pub const RELATIONSHIP_SYSTEM: &str = r#"You compare two code-change themes from different levels of a drill-down tree. The "higher" theme is more general; the "lower" theme is more specific.

Return:
- relationship: "duplicate" (same change), "overlap" (substantially the same code and purpose), "related" (same area, different change) or "distinct"
- action: "merge_up" (fold lower into higher), "merge_down", "merge_sibling" or "keep_separate"
- score: 0.0 to 1.0 confidence that the two should be merged
- reasoning: one short sentence

Only recommend merging when a reviewer would be confused by seeing both. Being in the same feature is not enough."#;
