//! Embedded fallback prompts
//!
//! Compiled into the binary and used when no template directory override
//! is configured. Template placeholders use handlebars syntax.

/// Blend multiple OCR readings of one page into a single text
pub const BLEND: &str = r#"You are reconstructing the text of one scanned book page.

You are given {{ocr_count}} OCR readings of the same page, produced by different engines. Each engine makes different mistakes. Produce the single most faithful text of the page.

Rules:
- Prefer readings that agree across engines.
- Fix obvious OCR confusions (rn/m, l/1/I, 0/O) using context.
- Preserve paragraph breaks, headings, and printed page furniture exactly once.
- Do not summarize, translate, or modernize spelling.

{{#each readings}}
=== Reading from {{this.provider}} ===
{{this.text}}

{{/each}}
Record the blended page text."#;

/// Label one blended page
pub const LABEL: &str = r#"You are labeling one page of a scanned book.

Book pattern context:
{{pattern_context}}

Page {{page}} text:
{{page_text}}

Identify:
- the printed page number label on this page, if visible ("42", "xii")
- any headings on the page
- the running header and footer text, if present
- whether this page is part of a table of contents

Record the label."#;

/// Extract bibliographic metadata from early pages
pub const METADATA: &str = r#"You are cataloging a scanned book from its first pages.

{{#each pages}}
=== Page {{this.page}} ===
{{this.text}}

{{/each}}
Determine the title, author, publisher, publication year, and language. Use null for anything not stated on these pages. Record the metadata."#;

/// System prompt for the ToC finder agent
pub const TOC_FIND_SYSTEM: &str = r#"You locate the table of contents in a scanned book.

The book has {{total_pages}} pages. Use grep_text to search for phrases like "contents", chapter listings with page numbers, and use get_page_ocr to read candidate pages. Tables of contents are normally in the first tenth of the scan.

When you have checked enough pages to be confident, record your result: whether a table of contents exists, and if so its first and last scan page. If the book has no table of contents, record found=false."#;

/// Extract structured entries from located ToC pages
pub const TOC_EXTRACT: &str = r#"You are reading the table of contents of a scanned book.

{{#each pages}}
=== Page {{this.page}} ===
{{this.text}}

{{/each}}
Extract every entry in order. For each entry give: the title as printed, its nesting level (0 for top level), the structural identifier if the title follows a pattern ("Chapter 7" has identifier "7"), and the printed page number if shown. Record the entries."#;

/// System prompt for the per-entry ToC linker agent
pub const ENTRY_FIND_SYSTEM: &str = r#"You find the scan page where one table-of-contents entry actually begins.

The book has {{total_pages}} pages. The printed page number in the ToC differs from the scan page number by some offset (front matter, plates). Use grep_text to find the entry title or its opening words; use get_page_ocr to confirm the chapter actually starts on a page (a heading near the top, not a mention in running text). Matches flagged "in back matter" are usually an index or notes, not the chapter itself.

Entry to locate:
  title: {{title}}
  printed page: {{printed_page}}

When confident, record the scan page where this entry begins, or found=false if it cannot be located."#;

/// Page-number pattern sub-analysis
pub const PATTERN_PAGE_NUMBERS: &str = r#"You are analyzing how printed page numbers behave in a scanned book.

Sample of page labels (scan page -> printed label):
{{samples}}

Describe the page-number pattern: numbering style(s), where arabic numbering starts, and the offset between scan pages and printed numbers. Record the pattern."#;

/// Chapter-heading pattern sub-analysis
pub const PATTERN_CHAPTERS: &str = r#"You are analyzing the chapter-heading conventions of a scanned book.

Headings observed (scan page -> headings):
{{samples}}

Describe the structural patterns used for divisions ("Chapter N", "Part N", named sections) as a list of patterns. Record the patterns."#;

/// Body-boundary sub-analysis; runs after the other two
pub const PATTERN_BOUNDARIES: &str = r#"You are determining where the body of a scanned book begins and ends.

Page-number analysis:
{{page_number_analysis}}

Chapter-pattern analysis:
{{chapter_analysis}}

First and last page excerpts:
{{excerpts}}

Determine the first and last scan pages of the main body (excluding front matter and back matter). Record body_start and body_end as scan page numbers, with reasoning."#;

/// Finalize pattern phase: classify what the linked ToC reveals
pub const FINALIZE_PATTERN: &str = r#"You are auditing the linked table of contents of a scanned book for completeness.

Book has {{total_pages}} pages; body runs {{body_start}}-{{body_end}}.

Linked entries (title -> scan page):
{{entries}}

Identify:
- structural patterns with identifier ranges ("chapter" running 1..20) implied by the entries
- scan page ranges that are front matter or back matter and cannot contain chapter starts
Record the patterns, the excluded ranges, and your reasoning."#;

/// System prompt for the chapter finder agent (finalize discovery)
pub const CHAPTER_FIND_SYSTEM: &str = r#"You find a chapter that a book's table of contents is missing.

The book has {{total_pages}} pages. The linked entries suggest a {{level_name}} numbered {{identifier}} should exist, but no entry links to it. Use grep_text and get_page_ocr to find where it begins. Look between the neighboring {{level_name}}s if they are known.

Record the scan page where {{level_name}} {{identifier}} begins and its title as printed, or found=false if the book genuinely lacks it."#;

/// System prompt for the gap investigator agent (finalize validation)
pub const GAP_INVESTIGATE_SYSTEM: &str = r#"You investigate an unexplained span of pages in a scanned book.

The book has {{total_pages}} pages. Pages {{start_page}}-{{end_page}} fall between two linked table-of-contents entries with nothing pointing into them. Use grep_text and get_page_ocr to inspect the span.

Decide one of:
- add_entry: a chapter starts in the span that the ToC is missing (give its title and scan page)
- correct_entry: an existing entry is linked to the wrong page (give the entry title and the correct scan page)
- flag_for_review: something is wrong but you cannot fix it confidently
- no_fix_needed: the span is a long chapter's interior or other expected content
Record your decision."#;

/// Classify all chapters in one call
pub const CHAPTER_CLASSIFY: &str = r#"You are classifying the chapters of a structured book.

{{#each chapters}}
=== {{this.key}} ===
title: {{this.title}}
pages {{this.start_page}}-{{this.end_page}}, {{this.word_count}} words
opening: {{this.excerpt}}

{{/each}}
For every chapter record: matter_type (front, body, back), content_type (chapter, preface, foreword, index, bibliography, appendix, copyright, dedication, other), and audio_include (whether the chapter belongs in a spoken rendition - body chapters yes; indexes, bibliographies and copyright pages no)."#;

/// Polish one chapter's mechanical text
pub const CHAPTER_POLISH: &str = r#"You are cleaning the text of one book chapter for listening.

The text below was merged from per-page OCR. Produce a list of edit operations that remove remaining scan artifacts: mid-word line-break hyphenation, stray page furniture, repeated headings. Do not rewrite the author's prose.

Each edit is one of:
- {"op": "replace", "find": "...", "replace": "..."} (first occurrence)
- {"op": "delete", "find": "..."} (first occurrence)

Chapter: {{title}}

{{text}}

Record the edits (an empty list is a valid answer)."#;
