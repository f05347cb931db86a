//! Minimal RFC 4180 reader.
//!
//! Rows are read one at a time so a malformed row yields an error for that
//! row only; the reader resynchronizes at the next line break.

use std::iter::Peekable;
use std::str::Chars;

/// One physical CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CsvRow {
    /// 1-based line on which the row starts.
    pub line: usize,
    pub fields: Result<Vec<String>, String>,
}

/// Split `text` into rows. Blank lines are skipped.
pub(crate) fn read_rows(text: &str) -> Vec<CsvRow> {
    let mut rows = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    loop {
        match chars.peek() {
            None => break,
            Some('\n') => {
                chars.next();
                line += 1;
                continue;
            }
            Some('\r') => {
                chars.next();
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                line += 1;
                continue;
            }
            Some(_) => {}
        }

        let start_line = line;
        let fields = read_row(&mut chars, &mut line);
        rows.push(CsvRow {
            line: start_line,
            fields,
        });
    }

    rows
}

fn read_row(chars: &mut Peekable<Chars<'_>>, line: &mut usize) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();

    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err("unterminated quoted field".to_string()),
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some('\n') => {
                        *line += 1;
                        field.push('\n');
                    }
                    Some(c) => field.push(c),
                }
            }
            if !matches!(chars.peek(), None | Some(',') | Some('\n') | Some('\r')) {
                skip_line(chars, line);
                return Err("unexpected text after closing quote".to_string());
            }
        } else {
            loop {
                match chars.peek() {
                    None | Some(',') | Some('\n') | Some('\r') => break,
                    Some('"') => {
                        skip_line(chars, line);
                        return Err("unexpected quote in unquoted field".to_string());
                    }
                    Some(&c) => {
                        field.push(c);
                        chars.next();
                    }
                }
            }
        }

        fields.push(std::mem::take(&mut field));

        match chars.next() {
            Some(',') => continue,
            Some('\r') => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                *line += 1;
                return Ok(fields);
            }
            Some('\n') => {
                *line += 1;
                return Ok(fields);
            }
            _ => return Ok(fields),
        }
    }
}

fn skip_line(chars: &mut Peekable<Chars<'_>>, line: &mut usize) {
    for c in chars.by_ref() {
        if c == '\n' {
            *line += 1;
            break;
        }
    }
}

/// Quote a field for output when it contains a delimiter, quote or line break.
pub(crate) fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
    {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
