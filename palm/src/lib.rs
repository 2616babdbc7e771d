//! Palm Desktop memo export library.
//! Decodes the text dumps written by Palm Desktop's "Export..." command (Mac 4.x "Tab & Return"
//! and Windows 6.x quoted CSV/TSV), recovers note records from them, and prepares those notes for
//! upload into a remote note service.

pub mod core {
    use chrono::{DateTime, Local};
    use serde::{Deserialize, Serialize};

    /* ------------------------------ Dialects ------------------------------ */

    /// Which export variant produced a set of notes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Dialect {
        /// Palm Desktop for Mac: tab-separated, 8 fixed columns, carries a modification date.
        Mac,
        /// Palm Desktop for Windows: quoted fields, 3 columns, no timestamp.
        Win,
    }

    impl Dialect {
        pub fn label(self) -> &'static str {
            match self {
                Dialect::Mac => "Mac",
                Dialect::Win => "Windows",
            }
        }
    }

    /* -------------------------------- Notes -------------------------------- */

    pub const PRIVATE: &str = "Private";
    pub const NOT_PRIVATE: &str = "Not Private";

    /// One memo recovered from an export file. Only ever built fully populated.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Note {
        /// First line of the memo, right-trimmed. May be empty.
        pub title: String,
        /// Full memo text, lines joined with `\n`. Starts with the title line.
        pub body: String,
        pub modified_at: DateTime<Local>,
        /// Category labels in source order; duplicates and casing untouched.
        #[serde(default)]
        pub categories: Vec<String>,
        /// Privacy marker as written by the exporting app (localized on Mac).
        pub private: String,
    }

    /// Notes recovered by one dialect parser plus the number of candidate records it dropped.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ParsedRecords {
        pub notes: Vec<Note>,
        pub rejected: usize,
    }

    /// Result of running one dialect parser over a whole file.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DialectOutcome {
        NoMatch,
        Records(ParsedRecords),
    }

    impl DialectOutcome {
        pub fn len(&self) -> usize {
            match self {
                DialectOutcome::NoMatch => 0,
                DialectOutcome::Records(parsed) => parsed.notes.len(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl From<ParsedRecords> for DialectOutcome {
        fn from(parsed: ParsedRecords) -> Self {
            if parsed.notes.is_empty() {
                DialectOutcome::NoMatch
            } else {
                DialectOutcome::Records(parsed)
            }
        }
    }

    /// A whole-file parser for one export dialect.
    pub trait DialectParser {
        fn dialect(&self) -> Dialect;

        /// Parse every record in `text`, skipping the ones that do not fit.
        fn parse_all(&self, text: &str) -> ParsedRecords;

        fn outcome(&self, text: &str) -> DialectOutcome {
            DialectOutcome::from(self.parse_all(text))
        }
    }

    /* ------------------------------- Errors ------------------------------- */

    /// Fatal problems reading an export file. `Display` is the user-facing diagnostic.
    #[derive(Debug, thiserror::Error)]
    pub enum LoadError {
        #[error("unable to open '{path}': {source}")]
        Io {
            path: String,
            #[source]
            source: std::io::Error,
        },
        #[error("'{0}' is not a valid encoding")]
        UnsupportedEncoding(String),
        #[error("'{path}' is not valid {encoding} text")]
        Decode { path: String, encoding: String },
    }

    /// Why a single candidate record was dropped.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RecordError {
        #[error("expected 8 tab-separated columns, found {0}")]
        ColumnCount(usize),
        #[error("unrecognized modification date {0:?}")]
        BadDate(String),
        #[error("expected 3 quoted fields, found {0}")]
        FieldCount(usize),
        #[error("unsupported field separator {0:?}")]
        Separator(Option<char>),
    }
}

pub mod splitter {
    //! Tokenizer for double-quote delimited fields.
    //!
    //! A `"` inside a quoted span followed by another `"` is a literal quote; any other `"`
    //! opens or closes a field. Outside quotes the first character seen is latched as the
    //! field separator, and every later boundary character must be that separator or a line
    //! break. Anything else marks the split as suspicious; in tolerant mode those stray
    //! characters are collected and emitted as an unquoted field of their own.

    /// Output of one pass over the input.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct SplitFields {
        pub fields: Vec<String>,
        pub separator: Option<char>,
        pub suspicious: bool,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum SplitMode {
        #[default]
        Strict,
        /// Recover files where only some fields are quoted (`"a\nb",0,Unfiled`).
        Tolerant,
    }

    fn is_line_break(c: char) -> bool {
        c == '\n' || c == '\r'
    }

    pub fn split_quoted_fields(text: &str, mode: SplitMode) -> SplitFields {
        let tolerant = mode == SplitMode::Tolerant;
        let mut out = SplitFields::default();
        let mut field = String::new();
        let mut extras = String::new();
        let mut in_quote = false;
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            if in_quote {
                if ch == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        out.fields.push(std::mem::take(&mut field));
                        in_quote = false;
                    }
                } else {
                    field.push(ch);
                }
                continue;
            }

            if ch == '"' {
                if tolerant {
                    flush_extras(&mut out.fields, &mut extras);
                }
                in_quote = true;
                continue;
            }

            match out.separator {
                None => out.separator = Some(ch),
                Some(sep) if ch == sep || is_line_break(ch) => {
                    if tolerant {
                        flush_extras(&mut out.fields, &mut extras);
                    }
                }
                Some(_) => {
                    out.suspicious = true;
                    if tolerant {
                        extras.push(ch);
                    }
                }
            }
        }

        // Unterminated quote at EOF: keep whatever was collected.
        if !field.is_empty() {
            out.fields.push(field);
        }
        if tolerant {
            flush_extras(&mut out.fields, &mut extras);
        }
        out
    }

    fn flush_extras(fields: &mut Vec<String>, extras: &mut String) {
        if !extras.is_empty() {
            fields.push(std::mem::take(extras));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_input_yields_nothing() {
            let split = split_quoted_fields("", SplitMode::Strict);
            assert!(split.fields.is_empty());
            assert_eq!(split.separator, None);
            assert!(!split.suspicious);
        }

        #[test]
        fn fully_quoted_csv_recovers_embedded_quote_comma_and_newline() {
            let text = "\"He said \"\"hi\"\", then\nleft\",\"0\",\"Unfiled\"\n";
            let split = split_quoted_fields(text, SplitMode::Strict);
            assert_eq!(
                split.fields,
                vec!["He said \"hi\", then\nleft", "0", "Unfiled"]
            );
            assert_eq!(split.separator, Some(','));
            assert!(!split.suspicious);
        }

        #[test]
        fn field_of_only_doubled_quotes_is_a_run_of_quotes() {
            let split = split_quoted_fields("\"\"\"\"\"\"\"\"", SplitMode::Strict);
            assert_eq!(split.fields, vec!["\"\"\""]);
        }

        #[test]
        fn empty_quoted_field_is_kept() {
            let split = split_quoted_fields("\"a\",\"\",\"b\"", SplitMode::Strict);
            assert_eq!(split.fields, vec!["a", "", "b"]);
        }

        #[test]
        fn unquoted_fields_are_suspicious_and_recovered_in_tolerant_mode() {
            let text = "\"line1\nline2\",0,Unfiled\n\"next\",1,Business\n";
            let strict = split_quoted_fields(text, SplitMode::Strict);
            assert!(strict.suspicious);
            assert_eq!(strict.fields, vec!["line1\nline2", "next"]);

            let tolerant = split_quoted_fields(text, SplitMode::Tolerant);
            assert_eq!(
                tolerant.fields,
                vec!["line1\nline2", "0", "Unfiled", "next", "1", "Business"]
            );
            assert_eq!(tolerant.separator, Some(','));
        }

        #[test]
        fn crlf_record_breaks_are_not_suspicious() {
            let text = "\"a\"\t\"0\"\t\"Unfiled\"\r\n\"b\"\t\"1\"\t\"Home\"\r\n";
            let split = split_quoted_fields(text, SplitMode::Strict);
            assert!(!split.suspicious);
            assert_eq!(split.separator, Some('\t'));
            assert_eq!(split.fields.len(), 6);
        }

        #[test]
        fn tolerant_mode_flushes_unquoted_field_at_end_of_input() {
            let split = split_quoted_fields("\"a\nb\",0,Unfiled", SplitMode::Tolerant);
            assert_eq!(split.fields, vec!["a\nb", "0", "Unfiled"]);
            assert_eq!(split.separator, Some(','));
        }

        #[test]
        fn unterminated_quote_flushes_at_end_of_input() {
            let split = split_quoted_fields("\"a\",\"dangling", SplitMode::Strict);
            assert_eq!(split.fields, vec!["a", "dangling"]);
        }
    }
}

pub mod date {
    //! Free-text date grammar used by Mac export files.
    //!
    //! Seen in the wild: `March 5, 2011` (English), `5 mars 2011` (French), `5. März 2011`
    //! (German) and the C-locale numeric `3/5/11`. Month names are matched case-sensitively
    //! against an explicit [`MonthNames`] table rather than process locale state.

    use chrono::{DateTime, Local, NaiveDate, TimeZone};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{take_till, take_while, take_while_m_n},
        character::complete::{char, one_of},
        combinator::{all_consuming, map_res},
        multi::separated_list0,
        sequence::{pair, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T>;

    /* ---------------------------- Month tables ---------------------------- */

    const ENGLISH: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];

    /// Full month names as the platform C library renders `%B` for each language.
    const LOCALES: &[(&str, [&str; 12])] = &[
        ("en", ENGLISH),
        (
            "fr",
            [
                "janvier",
                "février",
                "mars",
                "avril",
                "mai",
                "juin",
                "juillet",
                "août",
                "septembre",
                "octobre",
                "novembre",
                "décembre",
            ],
        ),
        (
            "de",
            [
                "Januar",
                "Februar",
                "März",
                "April",
                "Mai",
                "Juni",
                "Juli",
                "August",
                "September",
                "Oktober",
                "November",
                "Dezember",
            ],
        ),
        (
            "es",
            [
                "enero",
                "febrero",
                "marzo",
                "abril",
                "mayo",
                "junio",
                "julio",
                "agosto",
                "septiembre",
                "octubre",
                "noviembre",
                "diciembre",
            ],
        ),
        (
            "it",
            [
                "gennaio",
                "febbraio",
                "marzo",
                "aprile",
                "maggio",
                "giugno",
                "luglio",
                "agosto",
                "settembre",
                "ottobre",
                "novembre",
                "dicembre",
            ],
        ),
        (
            "nl",
            [
                "januari",
                "februari",
                "maart",
                "april",
                "mei",
                "juni",
                "juli",
                "augustus",
                "september",
                "oktober",
                "november",
                "december",
            ],
        ),
        (
            "pt",
            [
                "janeiro",
                "fevereiro",
                "março",
                "abril",
                "maio",
                "junho",
                "julho",
                "agosto",
                "setembro",
                "outubro",
                "novembro",
                "dezembro",
            ],
        ),
        (
            "sv",
            [
                "januari",
                "februari",
                "mars",
                "april",
                "maj",
                "juni",
                "juli",
                "augusti",
                "september",
                "oktober",
                "november",
                "december",
            ],
        ),
    ];

    /// Month-name to month-number lookup (1..=12).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MonthNames {
        names: IndexMap<String, u32>,
    }

    impl MonthNames {
        /// Build a table from exactly twelve names, January first.
        pub fn new<I, S>(names: I) -> Option<Self>
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let names: IndexMap<String, u32> = names
                .into_iter()
                .zip(1..)
                .map(|(name, n)| (name.into(), n))
                .collect();
            (names.len() == 12).then_some(Self { names })
        }

        pub fn english() -> Self {
            Self::from_static(&ENGLISH)
        }

        /// Resolve a POSIX-style locale name (`de_DE.UTF-8`, `fr`, `C`) by its language part.
        pub fn for_locale(locale: &str) -> Option<Self> {
            let language = locale_language(locale);
            if matches!(language.as_str(), "" | "c" | "posix") {
                return Some(Self::english());
            }
            LOCALES
                .iter()
                .find(|(code, _)| *code == language)
                .map(|(_, names)| Self::from_static(names))
        }

        pub fn month(&self, name: &str) -> Option<u32> {
            self.names.get(name).copied()
        }

        fn from_static(names: &[&str; 12]) -> Self {
            Self {
                names: names.iter().zip(1..).map(|(n, m)| (n.to_string(), m)).collect(),
            }
        }
    }

    impl Default for MonthNames {
        fn default() -> Self {
            Self::english()
        }
    }

    fn locale_language(locale: &str) -> String {
        let base = locale
            .split(['.', '@'])
            .next()
            .unwrap_or_default()
            .trim();
        base.split(['_', '-'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /* ------------------------------- Parsing ------------------------------- */

    /// Parse a Palm modification date. Resolves to local noon on the parsed day.
    pub fn parse_palm_date(text: &str, months: &MonthNames) -> Option<DateTime<Local>> {
        let date = parse_numeric(text).or_else(|| parse_spelled(text, months))?;
        local_noon(date)
    }

    /// Noon keeps the calendar day stable across time-zone conversions.
    pub fn local_noon(date: NaiveDate) -> Option<DateTime<Local>> {
        let noon = date.and_hms_opt(12, 0, 0)?;
        Local.from_local_datetime(&noon).earliest()
    }

    /// `m/d/yy`, the C locale's `%x`.
    fn parse_numeric(text: &str) -> Option<NaiveDate> {
        let (_, (month, day, yy)) = all_consuming(numeric_date)(text).ok()?;
        let year = if yy >= 69 { 1900 + yy } else { 2000 + yy };
        NaiveDate::from_ymd_opt(year as i32, month, day)
    }

    fn numeric_date(i: &str) -> PResult<'_, (u32, u32, u32)> {
        let (i, (month, _, day, _, year)) = tuple((
            number(1, 2),
            char('/'),
            number(1, 2),
            char('/'),
            number(2, 2),
        ))(i)?;
        Ok((i, (month, day, year)))
    }

    fn number(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            map_res(take_while_m_n(min, max, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<u32>()
            })(i)
        }
    }

    /// `Month DD, YYYY` or `DD[.] Month YYYY`; the year always comes last.
    fn parse_spelled(text: &str, months: &MonthNames) -> Option<NaiveDate> {
        let (_, components) = all_consuming(date_components)(text).ok()?;
        let [first, second, year] = components.as_slice() else {
            return None;
        };
        let year = parse_year(year)?;
        let (month, day) = if let Some(month) = months.month(first) {
            (month, *second)
        } else if let Some(month) = months.month(second) {
            (month, *first)
        } else {
            return None;
        };
        let day = day.strip_suffix('.').unwrap_or(day).parse::<u32>().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// Split on a comma or space followed by any run of spaces.
    fn date_components(i: &str) -> PResult<'_, Vec<&str>> {
        separated_list0(
            pair(one_of(", "), take_while(|c: char| c == ' ')),
            take_till(|c: char| c == ',' || c == ' '),
        )(i)
    }

    fn parse_year(s: &str) -> Option<i32> {
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        } else {
            None
        }
    }

}

pub mod mac {
    //! Palm Desktop for Mac "Tab & Return" export.
    //!
    //! Records end with `\r`; each record has eight tab-separated columns in this order:
    //! title, body, time, date, modified, category 1, category 2, private flag. Line breaks
    //! inside a column are written as byte 0xA6, which is `¶` once the file is decoded as
    //! MacRoman.

    use crate::core::{Dialect, DialectParser, Note, ParsedRecords, RecordError};
    use crate::date::{MonthNames, parse_palm_date};
    use log::debug;

    pub const COLUMN_COUNT: usize = 8;
    pub const PARAGRAPH_MARK: char = '\u{00B6}';
    const RECORD_SEPARATOR: char = '\r';
    const COLUMN_SEPARATOR: char = '\t';

    const TITLE: usize = 0;
    const BODY: usize = 1;
    const MODIFIED: usize = 4;
    const CATEGORY_1: usize = 5;
    const CATEGORY_2: usize = 6;
    const PRIVATE: usize = 7;

    #[derive(Debug, Clone, Default)]
    pub struct MacNoteParser {
        months: MonthNames,
    }

    impl MacNoteParser {
        pub fn new(months: MonthNames) -> Self {
            Self { months }
        }

        pub fn parse_record(&self, line: &str) -> Result<Note, RecordError> {
            let columns: Vec<String> = line
                .split(COLUMN_SEPARATOR)
                .map(|column| column.replace(PARAGRAPH_MARK, "\n"))
                .collect();
            if columns.len() != COLUMN_COUNT {
                return Err(RecordError::ColumnCount(columns.len()));
            }

            let modified_at = parse_palm_date(&columns[MODIFIED], &self.months)
                .ok_or_else(|| RecordError::BadDate(columns[MODIFIED].clone()))?;

            // The title duplicates the first body line, as untitled notes do in the target service.
            Ok(Note {
                title: columns[TITLE].trim_end().to_string(),
                body: format!("{}\n{}", columns[TITLE], columns[BODY]),
                modified_at,
                categories: columns[CATEGORY_1..=CATEGORY_2]
                    .iter()
                    .filter(|label| !label.is_empty())
                    .cloned()
                    .collect(),
                private: columns[PRIVATE].clone(),
            })
        }
    }

    impl DialectParser for MacNoteParser {
        fn dialect(&self) -> Dialect {
            Dialect::Mac
        }

        fn parse_all(&self, text: &str) -> ParsedRecords {
            let mut parsed = ParsedRecords::default();
            for (idx, line) in text
                .split(RECORD_SEPARATOR)
                .enumerate()
                .filter(|(_, line)| !line.is_empty())
            {
                match self.parse_record(line) {
                    Ok(note) => parsed.notes.push(note),
                    Err(err) => {
                        debug!("mac record {} skipped: {}", idx + 1, err);
                        parsed.rejected += 1;
                    }
                }
            }
            parsed
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn parser() -> MacNoteParser {
            MacNoteParser::new(MonthNames::english())
        }

        #[test]
        fn parses_eight_column_record() {
            let line = "Groceries  \tmilk¶eggs\t\t\tMarch 5, 2011\tPersonal\tHome\tNot Private";
            let note = parser().parse_record(line).expect("record");
            assert_eq!(note.title, "Groceries");
            assert_eq!(note.body, "Groceries  \nmilk\neggs");
            assert_eq!(
                note.modified_at.date_naive(),
                NaiveDate::from_ymd_opt(2011, 3, 5).unwrap()
            );
            assert_eq!(note.categories, vec!["Personal", "Home"]);
            assert_eq!(note.private, "Not Private");
        }

        #[test]
        fn empty_category_columns_are_dropped() {
            let line = "Title\tbody\t\t\t3/5/11\t\tWork\tPrivate";
            let note = parser().parse_record(line).expect("record");
            assert_eq!(note.categories, vec!["Work"]);
            assert_eq!(note.private, "Private");
        }

        #[test]
        fn wrong_column_count_is_rejected() {
            let err = parser()
                .parse_record("Title\tbody\tMarch 5, 2011")
                .expect_err("too few columns");
            assert_eq!(err, RecordError::ColumnCount(3));
        }

        #[test]
        fn unparsable_date_rejects_the_record() {
            let line = "Title\tbody\t\t\tsometime\t\t\tNot Private";
            let err = parser().parse_record(line).expect_err("bad date");
            assert_eq!(err, RecordError::BadDate("sometime".into()));
        }

        #[test]
        fn parse_all_skips_bad_records_and_counts_them() {
            let text = "A\ta\t\t\tMarch 5, 2011\t\t\tNot Private\r\
                        \r\
                        B\tb\t\t\tnever\t\t\tNot Private\r\
                        C\tc\r\
                        D\td\t\t\t5 March 2011\t\t\tNot Private\r";
            let parsed = parser().parse_all(text);
            let titles: Vec<_> = parsed.notes.iter().map(|n| n.title.as_str()).collect();
            assert_eq!(titles, vec!["A", "D"]);
            assert_eq!(parsed.rejected, 2);
        }

        #[test]
        fn no_eight_column_lines_means_no_notes() {
            let text = "one\ttwo\rthree\r\"q\",0,\"Unfiled\"\n";
            assert!(parser().parse_all(text).notes.is_empty());
            assert!(parser().outcome(text).is_empty());
        }
    }
}

pub mod win {
    //! Palm Desktop for Windows CSV / TSV export.
    //!
    //! Three quoted fields per record: memo text, private flag (`0`/`1`), categories. The comma
    //! variant uses `\n` for line breaks inside the memo; the tab variant uses `\r`. Some files
    //! quote only the memo text, which needs the tolerant splitter pass.

    use crate::core::{
        Dialect, DialectParser, NOT_PRIVATE, Note, PRIVATE, ParsedRecords, RecordError,
    };
    use crate::splitter::{SplitMode, split_quoted_fields};
    use chrono::{DateTime, Local};
    use log::debug;

    pub const FIELD_COUNT: usize = 3;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct WinNoteParser;

    impl WinNoteParser {
        /// Build a note from one `(text, private, categories)` triple.
        ///
        /// The export has no timestamp, so `now` stands in for the modification time.
        pub fn parse_record(
            &self,
            fields: &[String],
            separator: Option<char>,
            now: DateTime<Local>,
        ) -> Result<Note, RecordError> {
            let line_break = match separator {
                Some('\t') => '\r',
                Some(',') => '\n',
                other => return Err(RecordError::Separator(other)),
            };
            let [text, private, categories] = fields else {
                return Err(RecordError::FieldCount(fields.len()));
            };

            let lines: Vec<String> = text
                .split(line_break)
                .map(|line| line.replace('\r', ""))
                .collect();
            let title = lines
                .first()
                .map(|line| line.trim_end().to_string())
                .unwrap_or_default();

            Ok(Note {
                title,
                body: lines.join("\n"),
                modified_at: now,
                categories: categories
                    .split(',')
                    .map(|label| label.trim().to_string())
                    .collect(),
                private: if private == "1" { PRIVATE } else { NOT_PRIVATE }.to_string(),
            })
        }
    }

    impl DialectParser for WinNoteParser {
        fn dialect(&self) -> Dialect {
            Dialect::Win
        }

        fn parse_all(&self, text: &str) -> ParsedRecords {
            let mut split = split_quoted_fields(text, SplitMode::Strict);
            if split.suspicious {
                debug!("text outside quotes; retrying split in tolerant mode");
                split = split_quoted_fields(text, SplitMode::Tolerant);
            }

            let now = Local::now();
            let mut parsed = ParsedRecords::default();
            for (idx, chunk) in split.fields.chunks(FIELD_COUNT).enumerate() {
                match self.parse_record(chunk, split.separator, now) {
                    Ok(note) => parsed.notes.push(note),
                    Err(err) => {
                        debug!("windows record {} skipped: {}", idx + 1, err);
                        parsed.rejected += 1;
                    }
                }
            }
            parsed
        }
    }

}

pub mod loader {
    //! Reads an export file, normalizes it to clean UTF-8 text, and picks the dialect that
    //! actually produced notes. Mac results win when both dialects match.

    use crate::core::{Dialect, DialectOutcome, DialectParser, LoadError, Note, ParsedRecords};
    use crate::date::MonthNames;
    use crate::mac::MacNoteParser;
    use crate::win::WinNoteParser;
    use encoding_rs::Encoding;
    use log::{debug, info, warn};
    use serde::Serialize;
    use std::{borrow::Cow, fs, path::Path};

    /// Notes chosen from one export file, plus an advisory or failure message.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct LoadReport {
        pub notes: Vec<Note>,
        pub dialect: Option<Dialect>,
        pub diagnostic: Option<String>,
        /// Candidate records of the chosen dialect that failed to parse.
        pub rejected: usize,
    }

    impl LoadReport {
        fn accepted(dialect: Dialect, parsed: ParsedRecords, diagnostic: Option<String>) -> Self {
            Self {
                notes: parsed.notes,
                dialect: Some(dialect),
                diagnostic,
                rejected: parsed.rejected,
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct ExportLoader {
        mac: MacNoteParser,
        win: WinNoteParser,
    }

    impl ExportLoader {
        pub fn new(months: MonthNames) -> Self {
            Self {
                mac: MacNoteParser::new(months),
                win: WinNoteParser,
            }
        }

        pub fn load(&self, path: &Path, encoding: &str) -> Result<LoadReport, LoadError> {
            let origin = path.display().to_string();
            info!("reading export file '{}' with encoding '{}'", origin, encoding);
            let bytes = fs::read(path).map_err(|source| LoadError::Io {
                path: origin.clone(),
                source,
            })?;
            self.load_bytes(&bytes, encoding, &origin)
        }

        /// Same as [`ExportLoader::load`] for content already in memory; `origin` names it in
        /// diagnostics.
        pub fn load_bytes(
            &self,
            bytes: &[u8],
            encoding: &str,
            origin: &str,
        ) -> Result<LoadReport, LoadError> {
            let codec = resolve_encoding(encoding)?;
            let text = decode(bytes, codec).ok_or_else(|| LoadError::Decode {
                path: origin.to_string(),
                encoding: codec.name().to_string(),
            })?;
            let text = strip_control_chars(&text);
            Ok(self.parse_text(&text, origin))
        }

        /// Run both dialect parsers over already-sanitized text.
        pub fn parse_text(&self, text: &str, origin: &str) -> LoadReport {
            let mac = self.mac.outcome(text);
            debug!("{} format: {} notes", self.mac.dialect().label(), mac.len());
            let win = self.win.outcome(text);
            debug!("{} format: {} notes", self.win.dialect().label(), win.len());
            choose(mac, win, origin)
        }
    }

    /// Mac results take precedence; they carry real timestamps.
    pub fn choose(mac: DialectOutcome, win: DialectOutcome, origin: &str) -> LoadReport {
        match (mac, win) {
            (DialectOutcome::Records(mac), DialectOutcome::Records(win)) => {
                let msg = format!(
                    "found {} notes in Mac format and {} notes in Windows format; using the Mac format notes",
                    mac.notes.len(),
                    win.notes.len()
                );
                warn!("{}", msg);
                LoadReport::accepted(Dialect::Mac, mac, Some(msg))
            }
            (DialectOutcome::Records(parsed), DialectOutcome::NoMatch) => {
                info!("read {} notes in Mac format", parsed.notes.len());
                LoadReport::accepted(Dialect::Mac, parsed, None)
            }
            (DialectOutcome::NoMatch, DialectOutcome::Records(parsed)) => {
                info!("read {} notes in Windows format", parsed.notes.len());
                LoadReport::accepted(Dialect::Win, parsed, None)
            }
            (DialectOutcome::NoMatch, DialectOutcome::NoMatch) => LoadReport {
                diagnostic: Some(format!(
                    "'{}' does not look like a recognized Palm Desktop memo export format",
                    origin
                )),
                ..LoadReport::default()
            },
        }
    }

    /// Look up an encoding by WHATWG label, also accepting common Python-style names.
    pub fn resolve_encoding(name: &str) -> Result<&'static Encoding, LoadError> {
        let trimmed = name.trim();
        if let Some(codec) = Encoding::for_label(trimmed.as_bytes()) {
            return Ok(codec);
        }
        let label = trimmed.to_ascii_lowercase().replace('_', "-");
        let label = match label.as_str() {
            "macroman" | "mac-roman" | "mac" => "macintosh",
            "latin-1" => "latin1",
            other => other,
        };
        Encoding::for_label(label.as_bytes())
            .ok_or_else(|| LoadError::UnsupportedEncoding(name.to_string()))
    }

    fn decode<'a>(bytes: &'a [u8], codec: &'static Encoding) -> Option<Cow<'a, str>> {
        let text = codec.decode_without_bom_handling_and_without_replacement(bytes)?;
        Some(match text {
            Cow::Borrowed(s) => Cow::Borrowed(s.strip_prefix('\u{feff}').unwrap_or(s)),
            Cow::Owned(s) => match s.strip_prefix('\u{feff}') {
                Some(rest) => Cow::Owned(rest.to_string()),
                None => Cow::Owned(s),
            },
        })
    }

    /// Drop C0 control characters other than tab, carriage return, and newline.
    pub fn strip_control_chars(text: &str) -> String {
        text.chars()
            .filter(|&c| c >= ' ' || matches!(c, '\t' | '\r' | '\n'))
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn control_chars_are_stripped_but_whitespace_kept() {
            assert_eq!(strip_control_chars("a\u{7}b\u{0}c\u{1f}"), "abc");
            assert_eq!(strip_control_chars("a\tb\rc\nd"), "a\tb\rc\nd");
        }

        #[test]
        fn encoding_aliases_resolve() {
            assert_eq!(resolve_encoding("MacRoman").unwrap().name(), "macintosh");
            assert_eq!(resolve_encoding("mac_roman").unwrap().name(), "macintosh");
            assert_eq!(resolve_encoding("latin-1").unwrap().name(), "windows-1252");
            assert_eq!(resolve_encoding("cp1252").unwrap().name(), "windows-1252");
            assert_eq!(resolve_encoding("UTF-8").unwrap().name(), "UTF-8");
        }

        #[test]
        fn whatwg_labels_with_underscores_resolve_unchanged() {
            assert_eq!(
                resolve_encoding("ANSI_X3.4-1968").unwrap().name(),
                "windows-1252"
            );
            assert_eq!(
                resolve_encoding("iso_8859-1:1987").unwrap().name(),
                "windows-1252"
            );
            assert_eq!(resolve_encoding("ms_kanji").unwrap().name(), "Shift_JIS");
            assert_eq!(resolve_encoding("ks_c_5601-1987").unwrap().name(), "EUC-KR");
        }

        #[test]
        fn latin1_decodes_c1_range_as_windows_1252() {
            let report = ExportLoader::default()
                .load_bytes(b"\"wait\x85\",\"0\",\"Unfiled\"\n", "latin-1", "c1.csv")
                .expect("load");
            assert_eq!(report.notes[0].title, "wait\u{2026}");
        }

        #[test]
        fn unknown_encoding_names_the_offender() {
            let err = resolve_encoding("klingon").expect_err("unknown");
            assert_eq!(err.to_string(), "'klingon' is not a valid encoding");
        }

        #[test]
        fn invalid_bytes_fail_decoding() {
            let err = ExportLoader::default()
                .load_bytes(b"\xff\xfe\xfd", "utf-8", "memo.txt")
                .expect_err("invalid utf-8");
            assert!(matches!(err, LoadError::Decode { .. }));
            assert_eq!(err.to_string(), "'memo.txt' is not valid UTF-8 text");
        }

        #[test]
        fn leading_byte_order_mark_is_ignored() {
            let report = ExportLoader::default()
                .load_bytes("\u{feff}\"a\",\"0\",\"Unfiled\"\n".as_bytes(), "utf-8", "bom.csv")
                .expect("load");
            assert_eq!(report.dialect, Some(Dialect::Win));
            assert_eq!(report.notes[0].title, "a");
        }

        #[test]
        fn neither_dialect_gives_a_diagnostic() {
            let report = choose(DialectOutcome::NoMatch, DialectOutcome::NoMatch, "x.txt");
            assert!(report.notes.is_empty());
            assert_eq!(report.dialect, None);
            assert!(
                report
                    .diagnostic
                    .as_deref()
                    .unwrap_or_default()
                    .contains("does not look like a recognized")
            );
        }
    }
}

pub mod config {
    //! Import settings: which file, which byte encoding, which month-name locale.

    use crate::core::LoadError;
    use crate::date::MonthNames;
    use crate::loader::{ExportLoader, LoadReport};
    use log::warn;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    pub const DEFAULT_LOCALE: &str = "C";

    /// Encoding Palm Desktop most likely used on this platform.
    pub fn default_encoding() -> &'static str {
        if cfg!(target_os = "macos") {
            "macintosh"
        } else if cfg!(windows) {
            "windows-1252"
        } else {
            "latin1"
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ImportConfig {
        pub export_path: PathBuf,
        pub encoding: String,
        pub locale: String,
    }

    impl ImportConfig {
        pub fn new(export_path: impl Into<PathBuf>) -> Self {
            Self {
                export_path: export_path.into(),
                encoding: default_encoding().to_string(),
                locale: DEFAULT_LOCALE.to_string(),
            }
        }

        /// Month names for the configured locale, English when the locale is unknown.
        pub fn month_names(&self) -> MonthNames {
            MonthNames::for_locale(&self.locale).unwrap_or_else(|| {
                warn!(
                    "no month names for locale '{}'; using English for date parsing",
                    self.locale
                );
                MonthNames::english()
            })
        }

        pub fn load(&self) -> Result<LoadReport, LoadError> {
            ExportLoader::new(self.month_names()).load(&self.export_path, &self.encoding)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_use_platform_encoding_and_c_locale() {
            let config = ImportConfig::new("memos.txt");
            assert_eq!(config.encoding, default_encoding());
            assert_eq!(config.locale, "C");
            assert_eq!(config.month_names(), MonthNames::english());
        }

        #[test]
        fn unknown_locale_falls_back_to_english() {
            let config = ImportConfig {
                locale: "tlh_QO".into(),
                ..ImportConfig::new("memos.txt")
            };
            assert_eq!(config.month_names(), MonthNames::english());
        }
    }
}

pub mod import {
    //! Post-processing that feeds parsed notes into a remote note service.
    //!
    //! The service itself is external; [`NoteService`] is the seam. Titles are normalized to
    //! the service's limits, bodies wrapped in its XML envelope, and categories mapped to tags
    //! (looked up case-insensitively, created when missing).

    use crate::core::Note;
    use log::{info, warn};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    pub const IMPORT_NOTEBOOK: &str = "Palm import";
    pub const TITLE_LEN_MIN: usize = 1;
    pub const TITLE_LEN_MAX: usize = 255;
    pub const UNTITLED: &str = "(Untitled)";

    const ENML_HEADER: &str = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
        "<!DOCTYPE en-note SYSTEM \"http://xml.evernote.com/pub/enml.dtd\">",
        "<en-note>"
    );
    const ENML_FOOTER: &str = "</en-note>";

    /* ------------------------------ Service types ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Notebook {
        pub id: String,
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Tag {
        pub id: String,
        pub name: String,
    }

    /// A note ready for upload.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NewNote {
        pub notebook_id: String,
        pub title: String,
        pub content: String,
        /// Milliseconds since the epoch.
        pub created: i64,
        pub updated: i64,
        pub tag_ids: Vec<String>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ServiceError {
        #[error("note service error: {0}")]
        Remote(String),
    }

    /// Operations the importer needs from the remote note service.
    pub trait NoteService {
        fn list_notebooks(&mut self) -> Result<Vec<Notebook>, ServiceError>;
        fn create_notebook(&mut self, name: &str) -> Result<Notebook, ServiceError>;
        fn list_tags(&mut self) -> Result<Vec<Tag>, ServiceError>;
        fn create_tag(&mut self, name: &str) -> Result<Tag, ServiceError>;
        /// Returns the id of the created note.
        fn create_note(&mut self, note: NewNote) -> Result<String, ServiceError>;
    }

    /* ------------------------------ Normalization ------------------------------ */

    /// Service titles are 1..=255 characters and may not begin or end with whitespace.
    pub fn note_title(raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.chars().count() < TITLE_LEN_MIN {
            return UNTITLED.to_string();
        }
        let truncated: String = trimmed.chars().take(TITLE_LEN_MAX).collect();
        truncated.trim_end().to_string()
    }

    /// Escape each line and end it with `<br/>` inside the fixed note envelope.
    pub fn enml_content(body: &str) -> String {
        let mut content = String::with_capacity(ENML_HEADER.len() + body.len() * 2);
        content.push_str(ENML_HEADER);
        for line in body.split('\n') {
            escape_xml_into(line, &mut content);
            content.push_str("<br/>");
        }
        content.push_str(ENML_FOOTER);
        content
    }

    fn escape_xml_into(s: &str, out: &mut String) {
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(c),
            }
        }
    }

    /* ------------------------------- Tag lookup ------------------------------- */

    /// Category-name to tag-id resolution with a lazily fetched tag list.
    #[derive(Debug, Default)]
    pub struct TagResolver {
        cache: Option<Vec<Tag>>,
    }

    impl TagResolver {
        /// Ids for `names` in order, creating tags that do not exist yet. Empty names are skipped.
        pub fn resolve<S: NoteService + ?Sized>(
            &mut self,
            service: &mut S,
            names: &[String],
        ) -> Result<Vec<String>, ServiceError> {
            let mut ids = Vec::new();
            for name in names.iter().filter(|n| !n.is_empty()) {
                let id = match self.find(service, name)? {
                    Some(id) => id,
                    None => {
                        let tag = service.create_tag(name)?;
                        let id = tag.id.clone();
                        self.cache.get_or_insert_with(Vec::new).push(tag);
                        id
                    }
                };
                ids.push(id);
            }
            Ok(ids)
        }

        fn find<S: NoteService + ?Sized>(
            &mut self,
            service: &mut S,
            name: &str,
        ) -> Result<Option<String>, ServiceError> {
            if self.cache.is_none() {
                self.cache = Some(service.list_tags()?);
            }
            let needle = name.to_lowercase();
            Ok(self
                .cache
                .iter()
                .flatten()
                .find(|tag| tag.name.to_lowercase() == needle)
                .map(|tag| tag.id.clone()))
        }
    }

    /* -------------------------------- Importer -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImportSummary {
        pub created: usize,
        pub total: usize,
        pub cancelled: bool,
    }

    impl fmt::Display for ImportSummary {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.cancelled {
                write!(
                    f,
                    "Import cancelled ({}/{} complete)",
                    self.created, self.total
                )
            } else {
                write!(
                    f,
                    "Import complete, {}/{} notes succeeded",
                    self.created, self.total
                )
            }
        }
    }

    pub struct Importer<'s, S: NoteService> {
        service: &'s mut S,
        tags: TagResolver,
    }

    impl<'s, S: NoteService> Importer<'s, S> {
        pub fn new(service: &'s mut S) -> Self {
            Self {
                service,
                tags: TagResolver::default(),
            }
        }

        /// Reuse the import notebook if present, else create it.
        pub fn ensure_notebook(
            &mut self,
            progress: &mut dyn FnMut(&str),
        ) -> Result<Notebook, ServiceError> {
            let existing = self
                .service
                .list_notebooks()?
                .into_iter()
                .find(|nb| nb.name == IMPORT_NOTEBOOK);
            match existing {
                Some(notebook) => {
                    progress("Reusing import notebook");
                    Ok(notebook)
                }
                None => {
                    let notebook = self.service.create_notebook(IMPORT_NOTEBOOK)?;
                    progress("Created import notebook");
                    Ok(notebook)
                }
            }
        }

        /// Upload every note. A failing note is reported and skipped; `cancel` is polled
        /// before each note.
        pub fn run(
            &mut self,
            notes: &[Note],
            progress: &mut dyn FnMut(&str),
            cancel: &AtomicBool,
        ) -> Result<ImportSummary, ServiceError> {
            let notebook = self.ensure_notebook(progress)?;
            let mut summary = ImportSummary {
                created: 0,
                total: notes.len(),
                cancelled: false,
            };

            for (idx, note) in notes.iter().enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    summary.cancelled = true;
                    break;
                }
                let n = idx + 1;
                match self.upload(&notebook, note) {
                    Ok(_) => {
                        summary.created += 1;
                        progress(&format!(
                            "Created note {}/{}: {}",
                            n, summary.total, note.title
                        ));
                    }
                    Err(err) => {
                        let msg = format!(
                            "Failed note {}/{}: {} ({})",
                            n, summary.total, note.title, err
                        );
                        warn!("{}", msg);
                        progress(&msg);
                    }
                }
            }

            info!("{}", summary);
            Ok(summary)
        }

        fn upload(&mut self, notebook: &Notebook, note: &Note) -> Result<String, ServiceError> {
            let tag_ids = self.tags.resolve(&mut *self.service, &note.categories)?;
            let stamp = note.modified_at.timestamp_millis();
            self.service.create_note(NewNote {
                notebook_id: notebook.id.clone(),
                title: note_title(&note.title),
                content: enml_content(&note.body),
                created: stamp,
                updated: stamp,
                tag_ids,
            })
        }
    }

    /* ------------------------------ In-memory service ------------------------------ */

    /// Keeps everything in process; used for previews.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryService {
        pub notebooks: Vec<Notebook>,
        pub tags: Vec<Tag>,
        pub notes: Vec<(String, NewNote)>,
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    impl NoteService for MemoryService {
        fn list_notebooks(&mut self) -> Result<Vec<Notebook>, ServiceError> {
            Ok(self.notebooks.clone())
        }

        fn create_notebook(&mut self, name: &str) -> Result<Notebook, ServiceError> {
            let notebook = Notebook {
                id: new_id(),
                name: name.to_string(),
            };
            self.notebooks.push(notebook.clone());
            Ok(notebook)
        }

        fn list_tags(&mut self) -> Result<Vec<Tag>, ServiceError> {
            Ok(self.tags.clone())
        }

        fn create_tag(&mut self, name: &str) -> Result<Tag, ServiceError> {
            let tag = Tag {
                id: new_id(),
                name: name.to_string(),
            };
            self.tags.push(tag.clone());
            Ok(tag)
        }

        fn create_note(&mut self, note: NewNote) -> Result<String, ServiceError> {
            if !self.notebooks.iter().any(|nb| nb.id == note.notebook_id) {
                return Err(ServiceError::Remote(format!(
                    "unknown notebook {}",
                    note.notebook_id
                )));
            }
            let id = new_id();
            self.notes.push((id.clone(), note));
            Ok(id)
        }
    }

}

pub use crate::config::ImportConfig;
pub use crate::core::{Dialect, LoadError, Note};
pub use crate::loader::{ExportLoader, LoadReport};
