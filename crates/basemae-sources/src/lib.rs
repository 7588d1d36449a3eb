//! Source registry and raw report scanning for every complaint origin.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use basemae_core::Table;
use basemae_storage::read_table_file;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "basemae-sources";

/// Stable identifier for one complaint origin.
///
/// The wire key doubles as the sheet title inside the raw base workbook and
/// as the `Fonte_Dados` stamp on canonical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceId {
    Gov,
    Proconsumidor,
    #[serde(rename = "SP")]
    Sp,
    #[serde(rename = "SJC")]
    Sjc,
    Campinas,
    Uberlandia,
    #[serde(rename = "BCB_RDR")]
    BcbRdr,
    HugMe,
}

impl SourceId {
    pub const ALL: [SourceId; 8] = [
        SourceId::Gov,
        SourceId::Proconsumidor,
        SourceId::Sp,
        SourceId::Sjc,
        SourceId::Campinas,
        SourceId::Uberlandia,
        SourceId::BcbRdr,
        SourceId::HugMe,
    ];

    /// Wire key, as written in sheet titles and the `Fonte_Dados` column.
    pub fn key(self) -> &'static str {
        match self {
            SourceId::Gov => "Gov",
            SourceId::Proconsumidor => "Proconsumidor",
            SourceId::Sp => "SP",
            SourceId::Sjc => "SJC",
            SourceId::Campinas => "Campinas",
            SourceId::Uberlandia => "Uberlandia",
            SourceId::BcbRdr => "BCB_RDR",
            SourceId::HugMe => "HugMe",
        }
    }

    pub fn from_key(key: &str) -> Option<SourceId> {
        SourceId::ALL.iter().copied().find(|s| s.key() == key)
    }
}

/// How report files are arranged under a source's drop folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLayout {
    /// Report files sit directly in the folder.
    Flat,
    /// One subfolder per supplier company, each holding that company's
    /// report files.
    CompanyFolders,
}

/// Everything the pipeline needs to know about one source.
#[derive(Debug, Clone, Copy)]
pub struct SourceDescriptor {
    pub source: SourceId,
    /// Drop folder under the base path where raw exports land.
    pub raw_folder: &'static str,
    /// Consolidated artifact written into (and later read back from) the
    /// drop folder.
    pub consolidated_file: &'static str,
    /// Sheet title inside the consolidated artifact.
    pub sheet_name: &'static str,
    /// Rows to skip above the header in this source's raw export files.
    pub header_offset: usize,
    pub layout: SourceLayout,
    /// Raw export column -> master base column. Unmapped columns pass
    /// through under their own name; anything not in the canonical set
    /// after renaming is dropped at projection.
    pub rename_map: &'static [(&'static str, &'static str)],
}

const GOV_RENAMES: &[(&str, &str)] = &[
    ("Protocolo", "Protocolo_Origem"),
    ("Canal de Origem", "Canal_Origem"),
    ("Consumidor", "Consumidor_Nome"),
    ("CPF", "Consumidor_CPF"),
    ("UF", "Consumidor_UF"),
    ("Cidade", "Consumidor_Cidade"),
    ("Sexo", "Consumidor_Genero"),
    ("Faixa Etária", "Consumidor_Faixa_Etaria"),
    ("Data Abertura", "Data_Abertura"),
    ("Data Resposta", "Data_Resposta_Fornecedor"),
    ("Data Finalização", "Data_Finalizacao"),
    ("Nome Fantasia", "Fornecedor_Empresa"),
    ("Problema", "Descricao_Reclamacao"),
    ("Situação", "Status_Atual"),
    ("Avaliação Reclamação", "Resultado_Final"),
    ("Nota do Consumidor", "Nota_Consumidor"),
    ("Prazo Resposta", "Prazo_Resposta"),
];

const PROCONSUMIDOR_RENAMES: &[(&str, &str)] = &[
    ("Número de Atendimento", "Protocolo_Origem"),
    ("Documento Consumidor - CPF/CNPJ", "Consumidor_CPF"),
    ("Nome Consumidor", "Consumidor_Nome"),
    ("Gênero do Consumidor", "Consumidor_Genero"),
    ("Faixa Etária do Consumidor", "Consumidor_Faixa_Etaria"),
    ("CNPJ ou CPF Fornecedor", "Fornecedor_CNPJ"),
    ("Razão Social", "Fornecedor_RazaoSocial"),
    ("Nome Fantasia", "Fornecedor_Empresa"),
    ("Posto de Atendimento", "Canal_Origem"),
    ("Data de Abertura", "Data_Abertura"),
    ("Data da Finalização", "Data_Finalizacao"),
    ("Situação", "Status_Atual"),
    ("Classificação da Decisão", "Resultado_Final"),
];

const SP_RENAMES: &[(&str, &str)] = &[
    ("Protocolo", "Protocolo_Origem"),
    ("DataDaSolicitacao", "Data_Abertura"),
    ("DataDaBaixa", "Data_Finalizacao"),
    ("PostoDeAtendimento", "Canal_Origem"),
    ("Consumidor_Nome", "Consumidor_Nome"),
    ("Consumidor_Cpf", "Consumidor_CPF"),
    ("Consumidor_Endereco_Cidade", "Consumidor_Cidade"),
    ("Consumidor_Endereco_Estado", "Consumidor_UF"),
    ("Consumidor_Email", "Consumidor_Email"),
    ("Consumidor_Celular", "Consumidor_Celular"),
    ("Fornecedor_NomeFantasia", "Fornecedor_Empresa"),
    ("Reclamacao_Detalhes", "Descricao_Reclamacao"),
    ("Situacao", "Status_Atual"),
    ("ClassificacaoDaBaixa", "Resultado_Final"),
    ("DataDeRepostaDoFornecedor", "Data_Resposta_Fornecedor"),
    ("PrazoDeRespostaDoFornecedor", "Prazo_Resposta"),
];

// SJC and Campinas run the same municipal Procon system and export the
// same three-column layout.
const MUNICIPAL_PROCON_RENAMES: &[(&str, &str)] = &[
    ("Nº Reclamacão", "Protocolo_Origem"),
    ("Data de Reclamação", "Data_Abertura"),
    ("Última movimentação", "Status_Atual"),
];

const UBERLANDIA_RENAMES: &[(&str, &str)] = &[
    ("Número de Atendimento", "Protocolo_Origem"),
    ("Data de Abertura", "Data_Abertura"),
    ("Situação", "Status_Atual"),
    ("Nome Consumidor", "Consumidor_Nome"),
    ("Documento Consumidor - CPF/CNPJ", "Consumidor_CPF"),
    ("Nome Fantasia", "Fornecedor_Empresa"),
    ("Cidade Credenciada", "Consumidor_Cidade"),
    ("UF Credenciada", "Consumidor_UF"),
];

const BCB_RDR_RENAMES: &[(&str, &str)] = &[
    ("Número", "Protocolo_Origem"),
    ("Disponibilização", "Data_Abertura"),
    ("Data do Encerramento", "Data_Finalizacao"),
    ("Situação", "Status_Atual"),
    ("Canal de Atendimento", "Canal_Origem"),
    ("Instituição", "Fornecedor_Empresa"),
    ("CPF/CNPJ", "Consumidor_CPF"),
    ("Prazo", "Prazo_Resposta"),
];

const HUGME_RENAMES: &[(&str, &str)] = &[
    ("Empresa", "Fornecedor_Empresa"),
    ("Id HugMe", "Protocolo_Origem"),
    ("Data Reclamação", "Data_Abertura"),
    ("Status RA", "Status_Atual"),
    ("Texto da Reclamação", "Descricao_Reclamacao"),
    ("CPF/CNPJ", "Consumidor_CPF"),
    ("Email", "Consumidor_Email"),
    ("Telefones", "Consumidor_Celular"),
    ("Cidade", "Consumidor_Cidade"),
    ("Estado", "Consumidor_UF"),
    ("Data de Resposta", "Data_Resposta_Fornecedor"),
    ("Seu problema foi resolvido?", "Resultado_Final"),
];

/// Every supported source, in raw base sheet order. Positions match
/// [`SourceId::ALL`].
pub static REGISTRY: [SourceDescriptor; 8] = [
    SourceDescriptor {
        source: SourceId::Gov,
        raw_folder: "Relatorios_Consumidor_Gov",
        consolidated_file: "Relatorio_Consolidado_Gov.xlsx",
        sheet_name: "Consolidado_Gov",
        header_offset: 0,
        layout: SourceLayout::Flat,
        rename_map: GOV_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::Proconsumidor,
        raw_folder: "Relatorios_PROCONSUMIDOR",
        consolidated_file: "Relatorio_Consolidado.xlsx",
        sheet_name: "Unificado",
        header_offset: 0,
        layout: SourceLayout::CompanyFolders,
        rename_map: PROCONSUMIDOR_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::Sp,
        raw_folder: "Relatorios_PROCON_SP",
        consolidated_file: "Relatorio_Consolidado_SP.xlsx",
        sheet_name: "Consolidado",
        header_offset: 0,
        layout: SourceLayout::Flat,
        rename_map: SP_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::Sjc,
        raw_folder: "Relatorios_PROCON_SJC",
        consolidated_file: "Relatorio_Consolidado_SJC.xlsx",
        sheet_name: "Consolidado_SJC",
        header_offset: 1,
        layout: SourceLayout::Flat,
        rename_map: MUNICIPAL_PROCON_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::Campinas,
        raw_folder: "Relatorios_PROCON_CAMPINAS",
        consolidated_file: "Relatorio_Consolidado_Campinas.xlsx",
        sheet_name: "Consolidado_Campinas",
        header_offset: 1,
        layout: SourceLayout::Flat,
        rename_map: MUNICIPAL_PROCON_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::Uberlandia,
        raw_folder: "Relatorios_PROCON_UBERLANDIA",
        consolidated_file: "Relatorio_Consolidado_Uberlandia.xlsx",
        sheet_name: "Consolidado_Uberlandia",
        header_offset: 0,
        layout: SourceLayout::Flat,
        rename_map: UBERLANDIA_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::BcbRdr,
        raw_folder: "Relatorios_BCB_RDR",
        consolidated_file: "Relatorio_Consolidado_BCB_RDR.xlsx",
        sheet_name: "Consolidado_BCB",
        header_offset: 2,
        layout: SourceLayout::Flat,
        rename_map: BCB_RDR_RENAMES,
    },
    SourceDescriptor {
        source: SourceId::HugMe,
        raw_folder: "Relatorios_HUGME",
        consolidated_file: "Relatorio_Consolidado_HugMe.xlsx",
        sheet_name: "Consolidado_HugMe",
        header_offset: 3,
        layout: SourceLayout::Flat,
        rename_map: HUGME_RENAMES,
    },
];

pub fn registry() -> &'static [SourceDescriptor] {
    &REGISTRY
}

pub fn descriptor(source: SourceId) -> &'static SourceDescriptor {
    &REGISTRY[source as usize]
}

pub fn descriptor_for_key(key: &str) -> Option<&'static SourceDescriptor> {
    REGISTRY.iter().find(|d| d.source.key() == key)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry row {index} is {found}, expected {expected}")]
    OutOfOrder {
        index: usize,
        found: &'static str,
        expected: &'static str,
    },
    #[error("sources {0} and {1} share raw folder {2}")]
    DuplicateFolder(&'static str, &'static str, &'static str),
    #[error("sources {0} and {1} share sheet name {2}")]
    DuplicateSheetName(&'static str, &'static str, &'static str),
    #[error("source {0} has an empty raw folder")]
    EmptyFolder(&'static str),
    #[error("source {0} has an empty rename map")]
    EmptyRenameMap(&'static str),
    #[error("source {0} maps raw column {1} twice")]
    DuplicateRenameKey(&'static str, &'static str),
}

/// Sanity-checks the registry. Run once at pipeline startup so a bad edit
/// fails the run instead of silently dropping a source.
pub fn validate_registry() -> Result<(), RegistryError> {
    for (index, descriptor) in REGISTRY.iter().enumerate() {
        let expected = SourceId::ALL[index];
        if descriptor.source != expected {
            return Err(RegistryError::OutOfOrder {
                index,
                found: descriptor.source.key(),
                expected: expected.key(),
            });
        }
        if descriptor.raw_folder.is_empty() {
            return Err(RegistryError::EmptyFolder(descriptor.source.key()));
        }
        if descriptor.rename_map.is_empty() {
            return Err(RegistryError::EmptyRenameMap(descriptor.source.key()));
        }
        for (i, (raw, _)) in descriptor.rename_map.iter().enumerate() {
            if descriptor.rename_map[..i].iter().any(|(other, _)| other == raw) {
                return Err(RegistryError::DuplicateRenameKey(
                    descriptor.source.key(),
                    raw,
                ));
            }
        }
        for other in &REGISTRY[..index] {
            if other.raw_folder == descriptor.raw_folder {
                return Err(RegistryError::DuplicateFolder(
                    other.source.key(),
                    descriptor.source.key(),
                    descriptor.raw_folder,
                ));
            }
            if other.sheet_name == descriptor.sheet_name {
                return Err(RegistryError::DuplicateSheetName(
                    other.source.key(),
                    descriptor.source.key(),
                    descriptor.sheet_name,
                ));
            }
        }
    }
    Ok(())
}

/// Raw input filter applied to file names inside a drop folder. The
/// consolidated artifact and editor temp files share the folder with the
/// exports, so both are excluded by name.
pub fn is_raw_input(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    let supported =
        lower.ends_with(".xls") || lower.ends_with(".xlsx") || lower.ends_with(".csv");
    supported && !lower.starts_with("relatorio_consolidado") && !lower.ends_with(".tmp")
}

/// Outcome of scanning one source's drop folder.
#[derive(Debug)]
pub struct SourceScan {
    /// Union of every raw export, columns aligned by name.
    pub table: Table,
    /// Raw inputs parsed, including ones that held no data rows.
    pub files_read: usize,
    pub warnings: Vec<String>,
}

impl SourceScan {
    fn empty() -> Self {
        SourceScan {
            table: Table::new(),
            files_read: 0,
            warnings: Vec::new(),
        }
    }
}

/// Reads every raw export under the source's drop folder into one table.
///
/// A missing folder yields an empty scan with a warning rather than an
/// error: operators only create the folders for the sources they work. An
/// unreadable file inside an existing folder is an error; the caller
/// decides whether the stage survives it.
pub fn scan_source(base_path: &Path, descriptor: &SourceDescriptor) -> Result<SourceScan> {
    let folder = base_path.join(descriptor.raw_folder);
    let mut scan = SourceScan::empty();
    if !folder.is_dir() {
        scan.warnings.push(format!(
            "{}: folder {} not found, skipping",
            descriptor.source.key(),
            folder.display()
        ));
        return Ok(scan);
    }
    match descriptor.layout {
        SourceLayout::Flat => scan_flat_folder(&folder, descriptor, &mut scan)?,
        SourceLayout::CompanyFolders => scan_company_folders(&folder, descriptor, &mut scan)?,
    }
    Ok(scan)
}

/// File names in lexicographic order, for run-to-run deterministic output.
fn sorted_file_names(folder: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        fs::read_dir(folder).with_context(|| format!("reading folder {}", folder.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn sorted_subfolder_names(folder: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        fs::read_dir(folder).with_context(|| format!("reading folder {}", folder.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn scan_flat_folder(
    folder: &Path,
    descriptor: &SourceDescriptor,
    scan: &mut SourceScan,
) -> Result<()> {
    for name in sorted_file_names(folder)? {
        if !is_raw_input(&name) {
            continue;
        }
        let path = folder.join(&name);
        let table = read_table_file(&path, descriptor.header_offset)
            .with_context(|| format!("reading raw export {}", path.display()))?;
        scan.files_read += 1;
        if !table.is_empty() {
            scan.table.append_table(&table);
        }
    }
    Ok(())
}

/// One subfolder per supplier company. Rows from every company merge into
/// a single table with the company name stamped in `Fonte_Empresa`. Loose
/// files at the top level are not reports and are ignored.
fn scan_company_folders(
    folder: &Path,
    descriptor: &SourceDescriptor,
    scan: &mut SourceScan,
) -> Result<()> {
    for company in sorted_subfolder_names(folder)? {
        let company_dir = folder.join(&company);
        let mut company_table = Table::new();
        for name in sorted_file_names(&company_dir)? {
            if !is_raw_input(&name) {
                continue;
            }
            let path = company_dir.join(&name);
            let table = read_table_file(&path, descriptor.header_offset)
                .with_context(|| format!("reading raw export {}", path.display()))?;
            scan.files_read += 1;
            if !table.is_empty() {
                company_table.append_table(&table);
            }
        }
        if company_table.is_empty() {
            scan.warnings.push(format!(
                "{}: no report rows under company folder {}",
                descriptor.source.key(),
                company
            ));
            continue;
        }
        company_table.stamp_column("Fonte_Empresa", &company);
        scan.table.append_table(&company_table);
    }
    Ok(())
}
