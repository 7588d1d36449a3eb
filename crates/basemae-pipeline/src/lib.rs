//! Pipeline stages: consolidate raw exports, rebuild the raw base, generate
//! the canonical master base, sync new records to the remote tab.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use basemae_core::{
    normalize_cpf, normalize_date_text, record_identity, CanonicalColumn, CanonicalRecord,
    CellValue, Table,
};
use basemae_sources::{
    descriptor_for_key, registry, scan_source, validate_registry, SourceDescriptor,
};
use basemae_storage::{
    column_letter, write_workbook, RemoteTable, SheetData, WorkbookFile, WrittenArtifact,
};
use serde::Serialize;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "basemae-pipeline";

/// Union of every consolidated artifact, one sheet per source.
pub const RAW_BASE_FILE: &str = "Base_Mae_Bruta.xlsx";
/// The canonical master base artifact.
pub const MASTER_BASE_FILE: &str = "Base_Mae_Final.xlsx";
/// Sheet title used both in the master base file and on the remote store.
pub const MASTER_SHEET: &str = "Base_Mae_Final";
/// Number format applied to date columns on the remote store.
pub const REMOTE_DATE_PATTERN: &str = "dd/mm/yyyy";

pub fn raw_base_path(base_path: &Path) -> PathBuf {
    base_path.join(RAW_BASE_FILE)
}

pub fn master_base_path(base_path: &Path) -> PathBuf {
    base_path.join(MASTER_BASE_FILE)
}

pub fn consolidated_path(base_path: &Path, descriptor: &SourceDescriptor) -> PathBuf {
    base_path
        .join(descriptor.raw_folder)
        .join(descriptor.consolidated_file)
}

/// A1 range covering every canonical column of the remote tab.
pub fn remote_range() -> String {
    let last = column_letter(CanonicalColumn::ALL.len() - 1);
    format!("{MASTER_SHEET}!A:{last}")
}

/// What one stage did: records handled, warnings surfaced, artifacts
/// written. Warnings are operator-visible conditions the stage survived.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub records_processed: usize,
    pub warnings: Vec<String>,
    pub artifacts: Vec<WrittenArtifact>,
}

impl StageReport {
    fn new(stage: &'static str) -> Self {
        StageReport {
            stage,
            records_processed: 0,
            warnings: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(stage = self.stage, "{message}");
        self.warnings.push(message);
    }
}

/// Consolidates every source's raw exports into one artifact per source.
/// Sources are isolated: one failing source is reported and the rest still
/// consolidate.
pub async fn consolidate_sources(base_path: &Path) -> Result<StageReport> {
    validate_registry()?;
    let mut report = StageReport::new("consolidate");
    for descriptor in registry() {
        if let Err(err) = consolidate_one(base_path, descriptor, &mut report).await {
            report.warn(format!("{}: {err:#}", descriptor.source.key()));
        }
    }
    Ok(report)
}

async fn consolidate_one(
    base_path: &Path,
    descriptor: &SourceDescriptor,
    report: &mut StageReport,
) -> Result<()> {
    let scan = scan_source(base_path, descriptor)?;
    for warning in scan.warnings {
        report.warn(warning);
    }
    if scan.files_read == 0 {
        info!(
            source = descriptor.source.key(),
            "no raw exports to consolidate"
        );
        return Ok(());
    }
    if scan.table.is_empty() {
        report.warn(format!(
            "{}: {} raw exports held no data rows",
            descriptor.source.key(),
            scan.files_read
        ));
        return Ok(());
    }

    let path = consolidated_path(base_path, descriptor);
    let sheets = [SheetData {
        name: descriptor.sheet_name,
        table: &scan.table,
    }];
    let artifact = write_workbook(&path, &sheets).await?;
    info!(
        source = descriptor.source.key(),
        files = scan.files_read,
        rows = scan.table.row_count(),
        path = %path.display(),
        "consolidated source"
    );
    report.records_processed += scan.table.row_count();
    report.artifacts.push(artifact);
    Ok(())
}

/// Rebuilds the raw base workbook from the consolidated artifacts: one
/// sheet per source, titled with the source key, in registry order. Missing
/// or unreadable artifacts are skipped so a partial drop still produces a
/// usable base.
pub async fn build_raw_base(base_path: &Path) -> Result<StageReport> {
    let mut report = StageReport::new("raw-base");
    let mut copied: Vec<(&'static str, Table)> = Vec::new();

    for descriptor in registry() {
        let path = consolidated_path(base_path, descriptor);
        if !path.is_file() {
            report.warn(format!(
                "{}: consolidated artifact {} not found, skipping",
                descriptor.source.key(),
                path.display()
            ));
            continue;
        }
        match read_consolidated(&path) {
            Ok(table) if table.is_empty() => {
                report.warn(format!(
                    "{}: consolidated artifact holds no data rows, skipping",
                    descriptor.source.key()
                ));
            }
            Ok(table) => {
                report.records_processed += table.row_count();
                copied.push((descriptor.source.key(), table));
            }
            Err(err) => {
                report.warn(format!("{}: {err:#}", descriptor.source.key()));
            }
        }
    }

    if copied.is_empty() {
        report.warn(format!(
            "no consolidated artifacts under {}; raw base not written",
            base_path.display()
        ));
        return Ok(report);
    }

    let sheets: Vec<SheetData<'_>> = copied
        .iter()
        .map(|(name, table)| SheetData { name, table })
        .collect();
    let path = raw_base_path(base_path);
    let artifact = write_workbook(&path, &sheets).await?;
    info!(
        sheets = sheets.len(),
        records = report.records_processed,
        path = %path.display(),
        "raw base written"
    );
    report.artifacts.push(artifact);
    Ok(report)
}

fn read_consolidated(path: &Path) -> Result<Table> {
    // Consolidated artifacts always carry the header in their first row.
    WorkbookFile::open(path)?.read_first_sheet(0)
}

/// Builds the canonical master base from the raw base workbook: renames
/// source columns, projects onto the canonical set, normalizes dates and
/// documents, and assigns each record its identity.
pub async fn generate_master_base(base_path: &Path) -> Result<StageReport> {
    let raw_path = raw_base_path(base_path);
    if !raw_path.is_file() {
        bail!(
            "{RAW_BASE_FILE} not found under {}; run the raw-base stage first",
            base_path.display()
        );
    }
    let mut report = StageReport::new("master-base");

    let mut workbook = WorkbookFile::open(&raw_path)?;
    let header = CanonicalRecord::header_row();
    let mut master = Table::with_columns(header.clone());

    for sheet_name in workbook.sheet_names() {
        let descriptor = match descriptor_for_key(&sheet_name) {
            Some(descriptor) => descriptor,
            None => {
                report.warn(format!(
                    "sheet {sheet_name} does not match a registered source, skipping"
                ));
                continue;
            }
        };
        let table = match workbook.read_sheet(&sheet_name, 0) {
            Ok(table) => table,
            Err(err) => {
                report.warn(format!("{sheet_name}: {err:#}"));
                continue;
            }
        };
        for row in table.rows() {
            let record = canonical_record(descriptor, table.columns(), row, &mut report);
            let cells = record.to_row().into_iter().map(text_or_empty);
            master.push_record(header.iter().cloned().zip(cells).collect());
        }
        info!(
            source = descriptor.source.key(),
            rows = table.row_count(),
            "canonicalized source sheet"
        );
    }

    let path = master_base_path(base_path);
    let sheets = [SheetData {
        name: MASTER_SHEET,
        table: &master,
    }];
    let artifact = write_workbook(&path, &sheets).await?;
    info!(
        records = master.row_count(),
        path = %path.display(),
        "master base written"
    );
    report.records_processed = master.row_count();
    report.artifacts.push(artifact);
    Ok(report)
}

/// One raw row into a canonical record: rename, project, stamp the source,
/// normalize dates and the consumer document, then fix the identity.
fn canonical_record(
    descriptor: &SourceDescriptor,
    columns: &[String],
    row: &[CellValue],
    report: &mut StageReport,
) -> CanonicalRecord {
    let mut record = CanonicalRecord::new();
    for (name, cell) in columns.iter().zip(row) {
        let renamed = descriptor
            .rename_map
            .iter()
            .copied()
            .find(|(raw, _)| *raw == name.as_str())
            .map(|(_, target)| target)
            .unwrap_or(name.as_str());
        if let Some(column) = CanonicalColumn::from_name(renamed) {
            // An empty cell never clobbers a value an earlier column set.
            if !cell.is_empty() {
                record.set(column, cell.as_text());
            }
        }
    }
    record.set(CanonicalColumn::FonteDados, descriptor.source.key());

    for column in CanonicalColumn::DATE_COLUMNS {
        let normalized = normalize_date_text(record.get(column));
        record.set(column, normalized);
    }

    let document = normalize_cpf(record.get(CanonicalColumn::ConsumidorCpf));
    record.set(CanonicalColumn::ConsumidorCpf, document);

    let identity = record_identity(
        descriptor.source.key(),
        record.get(CanonicalColumn::ProtocoloOrigem),
    );
    if identity.synthetic {
        report.warn(format!(
            "{}: record without a protocol assigned id {}",
            descriptor.source.key(),
            identity.id
        ));
    }
    record.set(CanonicalColumn::IdReclamacaoUnico, identity.id);
    record
}

fn text_or_empty(value: String) -> CellValue {
    if value.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(value)
    }
}

/// Appends master base records the remote tab does not already hold.
/// Append-only by identity: rows already on the tab are never rewritten, so
/// workflow edits made on the remote store survive every sync.
pub async fn sync_to_remote(base_path: &Path, remote: &dyn RemoteTable) -> Result<StageReport> {
    let path = master_base_path(base_path);
    if !path.is_file() {
        bail!(
            "{MASTER_BASE_FILE} not found under {}; run the master-base stage first",
            base_path.display()
        );
    }
    let mut report = StageReport::new("sync");

    let mut workbook = WorkbookFile::open(&path)?;
    let local = if workbook.sheet_names().iter().any(|name| name == MASTER_SHEET) {
        workbook.read_sheet(MASTER_SHEET, 0)?
    } else {
        workbook.read_first_sheet(0)?
    };

    let titles = remote.sheet_titles().await?;
    if !titles.iter().any(|title| title == MASTER_SHEET) {
        bail!("remote store has no tab named {MASTER_SHEET}");
    }

    let range = remote_range();
    let existing = remote.get_range(&range).await?;
    let store_empty = existing.is_empty();
    let id_name = CanonicalColumn::IdReclamacaoUnico.as_str();

    let mut known_ids: HashSet<String> = HashSet::new();
    if let Some(remote_header) = existing.first() {
        match remote_header.iter().position(|name| name == id_name) {
            Some(id_col) => {
                for row in &existing[1..] {
                    if let Some(id) = row.get(id_col) {
                        if !id.is_empty() {
                            known_ids.insert(id.clone());
                        }
                    }
                }
            }
            None => report.warn(format!(
                "remote header lacks {id_name}; treating every local record as new"
            )),
        }
    }

    let mut to_append: Vec<Vec<String>> = Vec::new();
    let mut skipped = 0usize;
    for (idx, row) in local.rows().enumerate() {
        let values: Vec<String> = row.iter().map(CellValue::as_text).collect();
        let mut record = CanonicalRecord::from_row(local.columns(), &values);
        let id = record.get(CanonicalColumn::IdReclamacaoUnico).to_string();
        if id.is_empty() {
            report.warn(format!("master base row {} has no {id_name}, skipping", idx + 2));
            continue;
        }
        // Also collapses repeated ids inside the local batch to their
        // first occurrence.
        if !known_ids.insert(id) {
            skipped += 1;
            continue;
        }
        let document = normalize_cpf(record.get(CanonicalColumn::ConsumidorCpf));
        record.set(CanonicalColumn::ConsumidorCpf, document);
        if record.get(CanonicalColumn::Status).is_empty() {
            record.set(CanonicalColumn::Status, "Novo");
        }
        to_append.push(record.to_row());
    }

    if to_append.is_empty() {
        info!(skipped, "remote tab already holds every master base record");
        return Ok(report);
    }

    if store_empty {
        remote
            .append_rows(&range, &[CanonicalRecord::header_row()])
            .await?;
    }
    let appended = remote.append_rows(&range, &to_append).await?;
    report.records_processed = appended;

    // Format exactly the rows this run appended; the header row written to
    // an empty store sits above them.
    let first_data_row = if store_empty { 1 } else { existing.len() };
    let date_columns: Vec<usize> = CanonicalColumn::DATE_COLUMNS
        .iter()
        .map(|column| column.position())
        .collect();
    remote
        .format_date_columns(
            MASTER_SHEET,
            first_data_row,
            to_append.len(),
            &date_columns,
            REMOTE_DATE_PATTERN,
        )
        .await?;
    info!(appended, skipped, "master base synced to the remote tab");
    Ok(report)
}

/// Runs every stage in order against one base path.
pub async fn run_all(base_path: &Path, remote: &dyn RemoteTable) -> Result<Vec<StageReport>> {
    let mut reports = Vec::with_capacity(4);
    reports.push(consolidate_sources(base_path).await?);
    reports.push(build_raw_base(base_path).await?);
    reports.push(generate_master_base(base_path).await?);
    reports.push(sync_to_remote(base_path, remote).await?);
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use basemae_core::table_from_rows;
    use basemae_sources::{descriptor, SourceId};
    use basemae_storage::RemoteError;
    use rust_xlsxwriter::Workbook;
    use std::fs;
    use std::sync::Mutex;

    struct InMemoryRemote {
        titles: Vec<String>,
        rows: Mutex<Vec<Vec<String>>>,
        format_calls: Mutex<Vec<(usize, usize, Vec<usize>)>>,
    }

    impl InMemoryRemote {
        fn new() -> Self {
            Self {
                titles: vec![MASTER_SHEET.to_string()],
                rows: Mutex::new(Vec::new()),
                format_calls: Mutex::new(Vec::new()),
            }
        }

        fn seeded(rows: Vec<Vec<String>>) -> Self {
            let remote = Self::new();
            *remote.rows.lock().expect("seed rows") = rows;
            remote
        }

        fn without_master_tab() -> Self {
            Self {
                titles: Vec::new(),
                ..Self::new()
            }
        }

        fn snapshot(&self) -> Vec<Vec<String>> {
            self.rows.lock().expect("rows").clone()
        }

        fn formats(&self) -> Vec<(usize, usize, Vec<usize>)> {
            self.format_calls.lock().expect("formats").clone()
        }
    }

    #[async_trait]
    impl RemoteTable for InMemoryRemote {
        async fn sheet_titles(&self) -> Result<Vec<String>, RemoteError> {
            Ok(self.titles.clone())
        }

        async fn get_range(&self, _range: &str) -> Result<Vec<Vec<String>>, RemoteError> {
            Ok(self.snapshot())
        }

        async fn append_rows(
            &self,
            _range: &str,
            rows: &[Vec<String>],
        ) -> Result<usize, RemoteError> {
            self.rows.lock().expect("rows").extend(rows.iter().cloned());
            Ok(rows.len())
        }

        async fn clear_range(&self, _range: &str) -> Result<(), RemoteError> {
            self.rows.lock().expect("rows").clear();
            Ok(())
        }

        async fn format_date_columns(
            &self,
            _tab: &str,
            first_row: usize,
            row_count: usize,
            columns: &[usize],
            _pattern: &str,
        ) -> Result<(), RemoteError> {
            self.format_calls
                .lock()
                .expect("formats")
                .push((first_row, row_count, columns.to_vec()));
            Ok(())
        }
    }

    fn text(table: &Table, row: usize, column: &str) -> String {
        table
            .cell(row, column)
            .map(CellValue::as_text)
            .unwrap_or_default()
    }

    /// Gov-style export: protocol and document as text, the date as a raw
    /// spreadsheet serial, plus a column the canonical set does not know.
    fn write_gov_export(path: &Path) {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let header = ["Protocolo", "Data Abertura", "CPF", "Situação", "Observação Interna"];
        for (col, name) in header.iter().enumerate() {
            sheet.write_string(0, col as u16, *name).expect("header");
        }
        sheet.write_string(1, 0, "1").expect("protocol");
        sheet.write_number(1, 1, 44_958.0).expect("date serial");
        sheet.write_string(1, 2, "111.111.111-11").expect("document");
        sheet.write_string(1, 3, "Finalizada").expect("status");
        sheet.write_string(1, 4, "uso interno").expect("note");
        workbook.save(path).expect("save gov export");
    }

    fn prepare_two_source_base(base: &Path) {
        let gov = base.join(descriptor(SourceId::Gov).raw_folder);
        fs::create_dir_all(&gov).expect("gov folder");
        write_gov_export(&gov.join("janeiro.xlsx"));

        let sp = base.join(descriptor(SourceId::Sp).raw_folder);
        fs::create_dir_all(&sp).expect("sp folder");
        fs::write(
            sp.join("fevereiro.csv"),
            "Protocolo,DataDaSolicitacao,Consumidor_Cpf\n2,15/03/2023,45\n",
        )
        .expect("sp export");
    }

    async fn write_table_workbook(path: &Path, sheets: &[(&str, Vec<Vec<&str>>)]) {
        let tables: Vec<Table> = sheets
            .iter()
            .map(|(_, rows)| {
                let cells = rows.iter().map(|row| {
                    row.iter()
                        .map(|value| {
                            if value.is_empty() {
                                CellValue::Empty
                            } else {
                                CellValue::Text(value.to_string())
                            }
                        })
                        .collect()
                });
                table_from_rows(cells, 0)
            })
            .collect();
        let data: Vec<SheetData<'_>> = sheets
            .iter()
            .zip(&tables)
            .map(|((name, _), table)| SheetData { name: *name, table })
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("artifact folder");
        }
        write_workbook(path, &data).await.expect("write workbook");
    }

    fn canonical_row(id: &str, status: &str) -> Vec<String> {
        let mut record = CanonicalRecord::new();
        record.set(CanonicalColumn::IdReclamacaoUnico, id);
        record.set(CanonicalColumn::Status, status);
        record.to_row()
    }

    async fn write_master(base: &Path, rows: Vec<Vec<String>>) {
        let header = CanonicalRecord::header_row();
        let mut table = Table::with_columns(header.clone());
        for row in rows {
            let cells = row.into_iter().map(text_or_empty);
            table.push_record(header.iter().cloned().zip(cells).collect());
        }
        let sheets = [SheetData {
            name: MASTER_SHEET,
            table: &table,
        }];
        write_workbook(&master_base_path(base), &sheets)
            .await
            .expect("write master base");
    }

    #[test]
    fn remote_range_spans_the_canonical_columns() {
        assert_eq!(remote_range(), "Base_Mae_Final!A:W");
    }

    #[tokio::test]
    async fn pipeline_flows_from_raw_exports_to_the_remote_tab() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        prepare_two_source_base(base);

        let consolidate = consolidate_sources(base).await.expect("consolidate");
        assert_eq!(consolidate.artifacts.len(), 2);
        assert_eq!(consolidate.records_processed, 2);
        // The six sources without a drop folder this run.
        assert_eq!(consolidate.warnings.len(), 6);

        let raw = build_raw_base(base).await.expect("raw base");
        assert_eq!(raw.artifacts.len(), 1);
        assert_eq!(raw.records_processed, 2);
        assert_eq!(raw.warnings.len(), 6);

        let master = generate_master_base(base).await.expect("master base");
        assert_eq!(master.records_processed, 2);
        assert!(master.warnings.is_empty());

        let mut workbook = WorkbookFile::open(&master_base_path(base)).expect("open master");
        let table = workbook.read_sheet(MASTER_SHEET, 0).expect("read master");
        assert_eq!(table.columns().len(), CanonicalColumn::ALL.len());
        assert_eq!(table.row_count(), 2);
        assert_eq!(text(&table, 0, "ID_Reclamacao_Unico"), "Gov_1");
        assert_eq!(text(&table, 0, "Fonte_Dados"), "Gov");
        assert_eq!(text(&table, 0, "Data_Abertura"), "01/02/2023");
        assert_eq!(text(&table, 0, "Consumidor_CPF"), "11111111111");
        assert_eq!(text(&table, 0, "Status_Atual"), "Finalizada");
        assert_eq!(text(&table, 1, "ID_Reclamacao_Unico"), "SP_2");
        assert_eq!(text(&table, 1, "Data_Abertura"), "15/03/2023");
        assert_eq!(text(&table, 1, "Consumidor_CPF"), "00000000045");

        let remote = InMemoryRemote::new();
        let sync = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(sync.records_processed, 2);
        let rows = remote.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], CanonicalRecord::header_row());
        assert_eq!(rows[1][0], "Gov_1");
        assert_eq!(rows[1][CanonicalColumn::Status.position()], "Novo");
        assert_eq!(rows[2][0], "SP_2");
        assert_eq!(remote.formats(), vec![(1, 2, vec![3, 4, 5])]);

        let again = sync_to_remote(base, &remote).await.expect("second sync");
        assert_eq!(again.records_processed, 0);
        assert_eq!(remote.snapshot().len(), 3);
        assert_eq!(remote.formats().len(), 1);
    }

    #[tokio::test]
    async fn an_empty_drop_folder_contributes_no_sheet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();

        let gov = base.join(descriptor(SourceId::Gov).raw_folder);
        fs::create_dir_all(&gov).expect("gov folder");
        write_gov_export(&gov.join("janeiro.xlsx"));
        // SP exists but holds no exports yet.
        fs::create_dir_all(base.join(descriptor(SourceId::Sp).raw_folder)).expect("sp folder");

        let consolidate = consolidate_sources(base).await.expect("consolidate");
        assert_eq!(consolidate.artifacts.len(), 1);

        build_raw_base(base).await.expect("raw base");
        let workbook = WorkbookFile::open(&raw_base_path(base)).expect("open raw base");
        assert_eq!(workbook.sheet_names(), ["Gov"]);

        let master = generate_master_base(base).await.expect("master base");
        assert_eq!(master.records_processed, 1);

        let mut workbook = WorkbookFile::open(&master_base_path(base)).expect("open master");
        let table = workbook.read_sheet(MASTER_SHEET, 0).expect("read master");
        assert_eq!(text(&table, 0, "ID_Reclamacao_Unico"), "Gov_1");
        assert_eq!(text(&table, 0, "Consumidor_CPF"), "11111111111");
        assert_eq!(text(&table, 0, "Data_Abertura"), "01/02/2023");
    }

    #[tokio::test]
    async fn existing_remote_rows_are_never_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();

        let mut seeded = CanonicalRecord::new();
        seeded.set(CanonicalColumn::IdReclamacaoUnico, "Gov_1");
        seeded.set(CanonicalColumn::Status, "Processado");
        seeded.set(CanonicalColumn::Operador, "Maria");
        let remote =
            InMemoryRemote::seeded(vec![CanonicalRecord::header_row(), seeded.to_row()]);

        // The local copy of Gov_1 disagrees with the tab; the tab wins.
        write_master(
            base,
            vec![canonical_row("Gov_1", "Novo"), canonical_row("Gov_2", "")],
        )
        .await;

        let report = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(report.records_processed, 1);

        let rows = remote.snapshot();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][CanonicalColumn::Status.position()], "Processado");
        assert_eq!(rows[1][CanonicalColumn::Operador.position()], "Maria");
        assert_eq!(rows[2][0], "Gov_2");
        // Two rows already on the tab, so the new one starts right below.
        assert_eq!(remote.formats(), vec![(2, 1, vec![3, 4, 5])]);
    }

    #[tokio::test]
    async fn records_without_protocols_get_synthetic_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        let gov = descriptor(SourceId::Gov);
        write_table_workbook(
            &consolidated_path(base, gov),
            &[(
                gov.sheet_name,
                vec![
                    vec!["Protocolo", "Situação"],
                    vec!["", "Aberta"],
                    vec!["null", "Aberta"],
                    vec!["77", "Finalizada"],
                ],
            )],
        )
        .await;

        build_raw_base(base).await.expect("raw base");
        let report = generate_master_base(base).await.expect("master base");
        assert_eq!(report.records_processed, 3);
        assert_eq!(report.warnings.len(), 2);

        let mut workbook = WorkbookFile::open(&master_base_path(base)).expect("open master");
        let table = workbook.read_sheet(MASTER_SHEET, 0).expect("read master");
        let first = text(&table, 0, "ID_Reclamacao_Unico");
        let second = text(&table, 1, "ID_Reclamacao_Unico");
        for id in [&first, &second] {
            assert!(id.starts_with("Gov_"), "{id} should carry the source key");
            assert_eq!(id.len(), "Gov_".len() + 8);
        }
        assert_ne!(first, second);
        assert_eq!(text(&table, 2, "ID_Reclamacao_Unico"), "Gov_77");
    }

    #[tokio::test]
    async fn corrupt_consolidated_artifacts_do_not_abort_the_raw_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();

        let gov_path = consolidated_path(base, descriptor(SourceId::Gov));
        fs::create_dir_all(gov_path.parent().expect("parent")).expect("gov folder");
        fs::write(&gov_path, b"not a workbook").expect("corrupt artifact");

        let sp = descriptor(SourceId::Sp);
        write_table_workbook(
            &consolidated_path(base, sp),
            &[(sp.sheet_name, vec![vec!["Protocolo"], vec!["2"]])],
        )
        .await;

        let report = build_raw_base(base).await.expect("raw base");
        assert_eq!(report.artifacts.len(), 1);
        assert!(report.warnings.iter().any(|w| w.starts_with("Gov:")));

        let workbook = WorkbookFile::open(&raw_base_path(base)).expect("open raw base");
        assert_eq!(workbook.sheet_names(), ["SP"]);

        let master = generate_master_base(base).await.expect("master base");
        assert_eq!(master.records_processed, 1);
    }

    #[tokio::test]
    async fn unregistered_raw_base_sheets_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_table_workbook(
            &raw_base_path(base),
            &[
                ("Planilha1", vec![vec!["Coluna"], vec!["x"]]),
                ("Gov", vec![vec!["Protocolo"], vec!["5"]]),
            ],
        )
        .await;

        let report = generate_master_base(base).await.expect("master base");
        assert_eq!(report.records_processed, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Planilha1"));
    }

    #[tokio::test]
    async fn master_base_requires_the_raw_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = generate_master_base(dir.path())
            .await
            .expect_err("must fail without the raw base");
        assert!(err.to_string().contains(RAW_BASE_FILE));
        assert!(err.to_string().contains("raw-base stage"));
    }

    #[tokio::test]
    async fn sync_requires_the_master_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = InMemoryRemote::new();
        let err = sync_to_remote(dir.path(), &remote)
            .await
            .expect_err("must fail without the master base");
        assert!(err.to_string().contains(MASTER_BASE_FILE));
        assert!(err.to_string().contains("master-base stage"));
    }

    #[tokio::test]
    async fn sync_fails_when_the_remote_tab_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_master(base, vec![canonical_row("Gov_1", "")]).await;

        let remote = InMemoryRemote::without_master_tab();
        let err = sync_to_remote(base, &remote)
            .await
            .expect_err("tab is missing");
        assert!(format!("{err:#}").contains(MASTER_SHEET));
        assert!(remote.snapshot().is_empty());
    }

    #[tokio::test]
    async fn an_empty_master_base_appends_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_master(base, Vec::new()).await;

        let remote = InMemoryRemote::new();
        let report = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(report.records_processed, 0);
        assert!(remote.snapshot().is_empty());
        assert!(remote.formats().is_empty());
    }

    #[tokio::test]
    async fn remote_without_the_id_column_treats_all_records_as_new() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_master(base, vec![canonical_row("Gov_1", "")]).await;

        let remote = InMemoryRemote::seeded(vec![
            vec!["Coluna_Estranha".to_string()],
            vec!["x".to_string()],
        ]);
        let report = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(report.records_processed, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("ID_Reclamacao_Unico"));
        // Store was not empty, so no header row is added.
        assert_eq!(remote.snapshot().len(), 3);
        assert_eq!(remote.formats(), vec![(2, 1, vec![3, 4, 5])]);
    }

    #[tokio::test]
    async fn repeated_master_ids_append_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_master(
            base,
            vec![canonical_row("Gov_9", ""), canonical_row("Gov_9", "")],
        )
        .await;

        let remote = InMemoryRemote::new();
        let report = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(report.records_processed, 1);
        assert_eq!(remote.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn a_cleared_tab_is_synced_like_an_empty_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        write_master(base, vec![canonical_row("Gov_1", "")]).await;

        let remote = InMemoryRemote::seeded(vec![
            CanonicalRecord::header_row(),
            canonical_row("Gov_1", "Processado"),
        ]);
        remote.clear_range(&remote_range()).await.expect("clear");

        let report = sync_to_remote(base, &remote).await.expect("sync");
        assert_eq!(report.records_processed, 1);
        let rows = remote.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], CanonicalRecord::header_row());
        assert_eq!(remote.formats(), vec![(1, 1, vec![3, 4, 5])]);
    }

    #[tokio::test]
    async fn run_all_reports_every_stage_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        prepare_two_source_base(base);

        let remote = InMemoryRemote::new();
        let reports = run_all(base, &remote).await.expect("run all");
        let stages: Vec<&str> = reports.iter().map(|r| r.stage).collect();
        assert_eq!(stages, ["consolidate", "raw-base", "master-base", "sync"]);
        assert_eq!(reports[3].records_processed, 2);
    }
}
