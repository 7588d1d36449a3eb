//! Core domain model for the Base Mae pipeline: cell values, in-memory
//! tables, the canonical column set and the field normalizers.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "basemae-core";

/// Canonical textual date format carried by every artifact.
pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// One scalar cell as read from a spreadsheet or CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }

    /// Text the canonical artifacts carry for this cell. Integral numbers
    /// render without exponent or trailing fraction so numeric protocol and
    /// document columns survive textual projection.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => format_cell_number(*n),
        }
    }
}

fn format_cell_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One row still keyed by source-native column names.
pub type RawRecord = Vec<(String, CellValue)>;

/// In-memory tabular data: an ordered header plus row-major cells. Every
/// row holds exactly `columns.len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with a fixed header and no rows yet.
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[CellValue]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    fn ensure_column(&mut self, name: &str) -> usize {
        match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(CellValue::Empty);
                }
                self.columns.len() - 1
            }
        }
    }

    /// Appends one record, unioning previously-unseen column names onto the
    /// right edge in first-seen order.
    pub fn push_record(&mut self, record: RawRecord) {
        let mut row = vec![CellValue::Empty; self.columns.len()];
        for (name, value) in record {
            let idx = self.ensure_column(&name);
            if idx >= row.len() {
                row.resize(idx + 1, CellValue::Empty);
            }
            row[idx] = value;
        }
        row.resize(self.columns.len(), CellValue::Empty);
        self.rows.push(row);
    }

    /// Appends every row of `other`, aligning shared columns by name.
    pub fn append_table(&mut self, other: &Table) {
        for row in other.rows() {
            let record: RawRecord = other
                .columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect();
            self.push_record(record);
        }
    }

    /// Writes a constant text value onto every current row, creating the
    /// column when absent.
    pub fn stamp_column(&mut self, name: &str, value: &str) {
        let idx = self.ensure_column(name);
        for row in &mut self.rows {
            row[idx] = CellValue::Text(value.to_string());
        }
    }
}

/// Builds a table from raw sheet rows with the header found `header_offset`
/// rows down. Columns whose header cell is blank carry no key and are
/// dropped; rows with no non-empty cell are skipped. This is the single
/// header-offset rule every reader call site goes through.
pub fn table_from_rows<I>(raw_rows: I, header_offset: usize) -> Table
where
    I: IntoIterator<Item = Vec<CellValue>>,
{
    let mut iter = raw_rows.into_iter().skip(header_offset);
    let header = match iter.next() {
        Some(cells) => cells,
        None => return Table::new(),
    };

    let mut keep: Vec<(usize, String)> = Vec::new();
    for (idx, cell) in header.iter().enumerate() {
        let name = cell.as_text().trim().to_string();
        if !name.is_empty() {
            keep.push((idx, name));
        }
    }

    let mut table = Table::new();
    table.columns = keep.iter().map(|(_, name)| name.clone()).collect();
    for cells in iter {
        if cells.iter().all(CellValue::is_empty) {
            continue;
        }
        let row = keep
            .iter()
            .map(|(idx, _)| cells.get(*idx).cloned().unwrap_or(CellValue::Empty))
            .collect();
        table.rows.push(row);
    }
    table
}

/// The closed canonical column set, in artifact order (columns A..W of the
/// remote tab). Declaration order is the projection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalColumn {
    IdReclamacaoUnico,
    ProtocoloOrigem,
    FonteDados,
    DataAbertura,
    DataFinalizacao,
    PrazoResposta,
    CanalOrigem,
    ConsumidorNome,
    ConsumidorCpf,
    ConsumidorCidade,
    ConsumidorUf,
    ConsumidorEmail,
    ConsumidorCelular,
    ConsumidorFaixaEtaria,
    ConsumidorGenero,
    FornecedorEmpresa,
    DescricaoReclamacao,
    StatusAtual,
    ResultadoFinal,
    Operador,
    ResponsavelTrello,
    Status,
    IdCardTrello,
}

impl CanonicalColumn {
    pub const ALL: [CanonicalColumn; 23] = [
        CanonicalColumn::IdReclamacaoUnico,
        CanonicalColumn::ProtocoloOrigem,
        CanonicalColumn::FonteDados,
        CanonicalColumn::DataAbertura,
        CanonicalColumn::DataFinalizacao,
        CanonicalColumn::PrazoResposta,
        CanonicalColumn::CanalOrigem,
        CanonicalColumn::ConsumidorNome,
        CanonicalColumn::ConsumidorCpf,
        CanonicalColumn::ConsumidorCidade,
        CanonicalColumn::ConsumidorUf,
        CanonicalColumn::ConsumidorEmail,
        CanonicalColumn::ConsumidorCelular,
        CanonicalColumn::ConsumidorFaixaEtaria,
        CanonicalColumn::ConsumidorGenero,
        CanonicalColumn::FornecedorEmpresa,
        CanonicalColumn::DescricaoReclamacao,
        CanonicalColumn::StatusAtual,
        CanonicalColumn::ResultadoFinal,
        CanonicalColumn::Operador,
        CanonicalColumn::ResponsavelTrello,
        CanonicalColumn::Status,
        CanonicalColumn::IdCardTrello,
    ];

    /// Columns holding dates, normalized to `DATE_FORMAT`.
    pub const DATE_COLUMNS: [CanonicalColumn; 3] = [
        CanonicalColumn::DataAbertura,
        CanonicalColumn::DataFinalizacao,
        CanonicalColumn::PrazoResposta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalColumn::IdReclamacaoUnico => "ID_Reclamacao_Unico",
            CanonicalColumn::ProtocoloOrigem => "Protocolo_Origem",
            CanonicalColumn::FonteDados => "Fonte_Dados",
            CanonicalColumn::DataAbertura => "Data_Abertura",
            CanonicalColumn::DataFinalizacao => "Data_Finalizacao",
            CanonicalColumn::PrazoResposta => "Prazo_Resposta",
            CanonicalColumn::CanalOrigem => "Canal_Origem",
            CanonicalColumn::ConsumidorNome => "Consumidor_Nome",
            CanonicalColumn::ConsumidorCpf => "Consumidor_CPF",
            CanonicalColumn::ConsumidorCidade => "Consumidor_Cidade",
            CanonicalColumn::ConsumidorUf => "Consumidor_UF",
            CanonicalColumn::ConsumidorEmail => "Consumidor_Email",
            CanonicalColumn::ConsumidorCelular => "Consumidor_Celular",
            CanonicalColumn::ConsumidorFaixaEtaria => "Consumidor_Faixa_Etaria",
            CanonicalColumn::ConsumidorGenero => "Consumidor_Genero",
            CanonicalColumn::FornecedorEmpresa => "Fornecedor_Empresa",
            CanonicalColumn::DescricaoReclamacao => "Descricao_Reclamacao",
            CanonicalColumn::StatusAtual => "Status_Atual",
            CanonicalColumn::ResultadoFinal => "Resultado_Final",
            CanonicalColumn::Operador => "OPERADOR",
            CanonicalColumn::ResponsavelTrello => "RESPONSAVEL_TRELLO",
            CanonicalColumn::Status => "STATUS",
            CanonicalColumn::IdCardTrello => "ID_Card_Trello",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|col| col.as_str() == name)
    }

    pub const fn position(self) -> usize {
        self as usize
    }
}

/// One canonical row; cells indexed by `CanonicalColumn` position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    values: Vec<String>,
}

impl Default for CanonicalRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self {
            values: vec![String::new(); CanonicalColumn::ALL.len()],
        }
    }

    pub fn get(&self, column: CanonicalColumn) -> &str {
        &self.values[column.position()]
    }

    pub fn set(&mut self, column: CanonicalColumn, value: impl Into<String>) {
        self.values[column.position()] = value.into();
    }

    pub fn header_row() -> Vec<String> {
        CanonicalColumn::ALL
            .iter()
            .map(|col| col.as_str().to_string())
            .collect()
    }

    pub fn to_row(&self) -> Vec<String> {
        self.values.clone()
    }

    /// Rebuilds a record from a row under an arbitrary header. Header names
    /// outside the canonical set are ignored; canonical names absent from
    /// the header stay empty.
    pub fn from_row(header: &[String], row: &[String]) -> Self {
        let mut record = Self::new();
        for (idx, name) in header.iter().enumerate() {
            if let Some(col) = CanonicalColumn::from_name(name.trim()) {
                if let Some(value) = row.get(idx) {
                    record.set(col, value.clone());
                }
            }
        }
        record
    }
}

/// Days between serial 0 of the 1900 date system (1899-12-30) and the Unix
/// epoch; serial 25569 is 1970-01-01.
const SERIAL_UNIX_OFFSET: i64 = 25_569;

fn date_from_serial(serial: i64) -> Option<NaiveDate> {
    let days = serial.checked_sub(SERIAL_UNIX_OFFSET)?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    epoch.checked_add_signed(Duration::try_days(days)?)
}

fn year_in_range(date: &NaiveDate) -> bool {
    (1900..=9999).contains(&date.year())
}

/// Normalizes any date-bearing cell to `DATE_FORMAT`, or empty when the
/// value does not resolve to a real calendar date. Never fails; malformed
/// upstream dates are expected, not exceptional.
pub fn normalize_date(value: &CellValue) -> String {
    match value {
        CellValue::Empty => String::new(),
        CellValue::Number(n) => normalize_serial(*n),
        CellValue::Text(s) => normalize_date_text(s),
    }
}

fn normalize_serial(n: f64) -> String {
    // Only dot-free integral values count as spreadsheet serials.
    if n.fract() != 0.0 || !(n > 1.0) {
        return String::new();
    }
    match date_from_serial(n as i64) {
        Some(date) if year_in_range(&date) => date.format(DATE_FORMAT).to_string(),
        _ => String::new(),
    }
}

/// Text form of `normalize_date`: accepts `dd/mm/yyyy[ ...]` (two-digit
/// years read as 20xx), `yyyy-mm-dd[ ...]`, numeric serial strings, and
/// canonical output (idempotent pass-through). Everything else is empty.
pub fn normalize_date_text(raw: &str) -> String {
    let token = match raw.trim().split_whitespace().next() {
        Some(token) => token,
        None => return String::new(),
    };
    if let Ok(n) = token.parse::<f64>() {
        return normalize_serial(n);
    }
    let parsed = if token.contains('/') {
        parse_day_first(token)
    } else if token.contains('-') {
        parse_year_first(token)
    } else {
        None
    };
    match parsed {
        Some(date) if year_in_range(&date) => date.format(DATE_FORMAT).to_string(),
        _ => String::new(),
    }
}

fn parse_day_first(token: &str) -> Option<NaiveDate> {
    let mut parts = token.split('/');
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    let year_text = parts.next()?.trim();
    if parts.next().is_some() {
        return None;
    }
    let mut year = year_text.parse::<i32>().ok()?;
    if year_text.len() == 2 {
        year += 2000;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_year_first(token: &str) -> Option<NaiveDate> {
    let mut parts = token.split('-');
    let year = parts.next()?.trim().parse::<i32>().ok()?;
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Strips everything but digits and left-pads with zeros to the 11-digit
/// CPF width. Longer documents (CNPJ) keep their full digit count.
pub fn normalize_cpf(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    format!("{digits:0>11}")
}

/// Protocol values portals export when they have none.
fn protocol_is_missing(protocol: &str) -> bool {
    protocol.is_empty()
        || protocol.eq_ignore_ascii_case("null")
        || protocol.eq_ignore_ascii_case("undefined")
}

/// The stable record identity `{source}_{protocol}`. `synthetic` is set
/// when the protocol was missing and a random token stood in for it; the
/// caller is expected to surface a warning.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordIdentity {
    pub id: String,
    pub synthetic: bool,
}

pub fn record_identity(source: &str, protocol: &str) -> RecordIdentity {
    let protocol = protocol.trim();
    if protocol_is_missing(protocol) {
        let hex = Uuid::new_v4().simple().to_string();
        let token: String = hex.chars().take(8).collect();
        RecordIdentity {
            id: format!("{source}_{token}"),
            synthetic: true,
        }
    } else {
        RecordIdentity {
            id: format!("{source}_{protocol}"),
            synthetic: false,
        }
    }
}
