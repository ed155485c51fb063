//! Workbook parsing: first worksheet, optional header row, one recipient per
//! non-empty row.

use crate::phone::normalize_phone;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use tracing::debug;
use wasend_core::error::WasendError;

/// Header names recognised as the phone column (compared lowercase, trimmed).
pub const PHONE_HEADERS: &[&str] = &[
    "phone",
    "phone number",
    "number",
    "mobile",
    "whatsapp",
    "contact",
];

/// One data row of the recipient spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// 1-based spreadsheet row.
    pub row: u32,
    /// Normalised digits when valid, otherwise the raw cell text.
    pub phone: String,
    /// Lowercased header name to cell text. Always contains `phone`.
    pub fields: HashMap<String, String>,
    /// Why this row cannot be sent to, if it cannot.
    pub problem: Option<String>,
}

impl Recipient {
    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }
}

/// Parsed recipient spreadsheet.
#[derive(Debug, Clone, Default)]
pub struct RecipientSheet {
    /// Lowercased header names, empty when the sheet has no header row.
    pub headers: Vec<String>,
    pub recipients: Vec<Recipient>,
}

impl RecipientSheet {
    pub fn valid_count(&self) -> usize {
        self.recipients.iter().filter(|r| r.is_valid()).count()
    }
}

/// Parse an `.xlsx` / `.xls` / `.ods` workbook into recipients.
///
/// Fails when the bytes are not a readable workbook, the workbook has no
/// worksheet, or the first worksheet has no data rows. Rows with a bad or
/// repeated phone number are kept and flagged, so callers can account for
/// every row.
pub fn parse_recipients(bytes: &[u8]) -> Result<RecipientSheet, WasendError> {
    if bytes.is_empty() {
        return Err(WasendError::Spreadsheet("file is empty".into()));
    }

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| WasendError::Spreadsheet(format!("unreadable workbook: {e}")))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| WasendError::Spreadsheet("workbook has no worksheets".into()))?
        .map_err(|e| WasendError::Spreadsheet(format!("unreadable worksheet: {e}")))?;

    let first_row = range.start().map(|(row, _)| row).unwrap_or(0);

    let mut rows = range
        .rows()
        .enumerate()
        .map(|(idx, cells)| {
            let texts: Vec<String> = cells.iter().map(cell_text).collect();
            (first_row + idx as u32 + 1, texts)
        })
        .filter(|(_, texts)| texts.iter().any(|t| !t.is_empty()))
        .peekable();

    // Header detection on the first non-empty row.
    let mut headers = Vec::new();
    let mut phone_col = 0;
    if let Some((_, texts)) = rows.peek() {
        let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
        if let Some(col) = lowered.iter().position(|h| PHONE_HEADERS.contains(&h.as_str())) {
            phone_col = col;
            headers = lowered;
            rows.next();
        }
    }

    let mut seen = HashSet::new();
    let mut recipients = Vec::new();

    for (row, texts) in rows {
        let raw_phone = texts.get(phone_col).cloned().unwrap_or_default();

        let mut fields: HashMap<String, String> = headers
            .iter()
            .zip(texts.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.clone(), v.clone()))
            .collect();

        let (phone, problem) = match normalize_phone(&raw_phone) {
            Ok(digits) => {
                if seen.insert(digits.clone()) {
                    (digits, None)
                } else {
                    (digits, Some("duplicate recipient".to_string()))
                }
            }
            Err(reason) => (raw_phone, Some(reason)),
        };

        fields.insert("phone".to_string(), phone.clone());
        recipients.push(Recipient {
            row,
            phone,
            fields,
            problem,
        });
    }

    if recipients.is_empty() {
        return Err(WasendError::Spreadsheet(
            "spreadsheet has no recipient rows".into(),
        ));
    }

    debug!(
        rows = recipients.len(),
        header = !headers.is_empty(),
        "parsed recipient spreadsheet"
    );

    Ok(RecipientSheet {
        headers,
        recipients,
    })
}

/// Render a cell as trimmed text. Whole floats lose their `.0` so numeric
/// phone cells come out as plain digits.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e17 => format!("{f:.0}"),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string().trim().to_string(),
    }
}
