//! Workbook adapter for the CONFAZ ICMS collection bulletin.
//!
//! Turns the first sheet of the bulletin into [`IcmsRecord`]s: the header row
//! is resolved once into a [`HeaderMapping`], then every data row is coerced
//! field by field according to its [`FieldClass`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use calamine::{open_workbook_auto, Data, Reader};
use icms_core::{FieldClass, FieldId, FieldValue, IcmsRecord, AMOUNT_COLUMNS};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "icms-adapters";

/// 0-based row of the header in the bulletin's first sheet.
pub const DEFAULT_HEADER_ROW_INDEX: usize = 2;

const ZZ_COLUMN: &str = "divisao_zz_cnae_nao_identificado";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("header row {index} not found in first sheet")]
    MissingHeaderRow { index: usize },
}

static LABELS: Lazy<HashMap<&'static str, FieldId>> = Lazy::new(|| {
    let mut labels = HashMap::from([
        ("id_uf", FieldId::RegionId),
        ("UF", FieldId::Region),
        ("PERÍODO", FieldId::Period),
        ("PERÍODO ", FieldId::Period),
        ("ANO", FieldId::Year),
        ("MÊS", FieldId::Month),
    ]);
    let amounts = [
        ("IPVA - Total Arrecadado de IPVA", "ipva_total"),
        ("ITCMD - Total Arrecadado de ITCMD", "itcmd_total"),
        ("TAXA - Total Arrecadado de Taxas", "taxa_total"),
        ("ORTB - Total Arrecadado de Outras Receitas Tributárias", "outras_receitas_tributarias"),
        ("TOTAL DA ARRECADAÇÃO DE OUTROS TRIBUTOS", "total_outros_tributos"),
        ("DAIC - Total Arrecadado de Dívida Ativa de ICMS", "divida_ativa_icms"),
        ("DAIP - Total Arrecadado de Dívida Ativa de IPVA", "divida_ativa_ipva"),
        ("DAIT - Total Arrecadado de Dívida Ativa de ITCMD", "divida_ativa_itcmd"),
        ("TOTAL DE DÍVIDAS ATIVAS", "total_dividas_ativas"),
        ("Seção: A - AGRICULTURA, PECUÁRIA, PRODUÇÃO FLORESTAL, PESCA E AQUICULTURA", "secao_a_agricultura"),
        ("Seção: B - INDÚSTRIAS EXTRATIVAS", "secao_b_industrias_extrativas"),
        ("Seção: C - INDÚSTRIAS DE TRANSFORMAÇÃO", "secao_c_industrias_transformacao"),
        ("Seção: D - ELETRICIDADE E GÁS", "secao_d_eletricidade_gas"),
        ("Seção: E - ÁGUA, ESGOTO, ATIVIDADES DE GESTÃO DE RESÍDUOS E DESCONTAMINAÇÃO", "secao_e_agua_esgoto_residuos"),
        ("Seção: F - CONSTRUÇÃO", "secao_f_construcao"),
        ("Seção: G - COMÉRCIO; REPARAÇÃO DE VEÍCULOS AUTOMOTORES E MOTOCICLETAS", "secao_g_comercio"),
        ("Seção: H - TRANSPORTE, ARMAZENAGEM E CORREIO", "secao_h_transporte"),
        ("Seção: I - ALOJAMENTO E ALIMENTAÇÃO", "secao_i_alojamento_alimentacao"),
        ("Seção: J - INFORMAÇÃO E COMUNICAÇÃO", "secao_j_informacao_comunicacao"),
        ("Seção: K - ATIVIDADES FINANCEIRAS, DE SEGUROS E SERVIÇOS RELACIONADOS", "secao_k_atividades_financeiras"),
        ("Seção: L - ATIVIDADES IMOBILIÁRIAS", "secao_l_atividades_imobiliarias"),
        ("Seção: M - ATIVIDADES PROFISSIONAIS, CIENTÍFICAS E TÉCNICAS", "secao_m_atividades_profissionais"),
        ("Seção: N - ATIVIDADES ADMINISTRATIVAS E SERVIÇOS COMPLEMENTARES", "secao_n_atividades_administrativas"),
        ("Seção: O - ADMINISTRAÇÃO PÚBLICA, DEFESA E SEGURIDADE SOCIAL", "secao_o_administracao_publica"),
        ("Seção: P - EDUCAÇÃO", "secao_p_educacao"),
        ("Seção: Q - SAÚDE HUMANA E SERVIÇOS SOCIAIS", "secao_q_saude_servicos_sociais"),
        ("Seção: R - ARTES, CULTURA, ESPORTE E RECREAÇÃO", "secao_r_artes_cultura_esporte"),
        ("Seção: S - OUTRAS ATIVIDADES DE SERVIÇOS", "secao_s_outras_atividades_servicos"),
        ("Seção: T - SERVIÇOS DOMÉSTICOS", "secao_t_servicos_domesticos"),
        ("Seção: U - ORGANISMOS INTERNACIONAIS E OUTRAS INSTITUIÇÕES EXTRATERRITORIAIS", "secao_u_organismos_internacionais"),
        ("Seção: ZZ - TOTAL ICMS ARRECADADO DO CNAE NÃO IDENTIFICADO", "secao_zz_cnae_nao_identificado"),
        ("TOTAL SEÇÕES/ICMS", "total_icms"),
        ("TOTAL SEÇÕES/ICMS + OUTROS TRIBUTOS", "total_icms_outros_tributos"),
    ];
    labels.extend(
        amounts
            .into_iter()
            .map(|(label, column)| (label, FieldId::amount(column))),
    );
    labels
});

/// Division code (`01`..`99`, `zz`) to catalog column, derived from the
/// `divisao_<code>_<name>` column naming.
static DIVISION_COLUMNS: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    AMOUNT_COLUMNS
        .iter()
        .filter_map(|column| {
            let rest = column.strip_prefix("divisao_")?;
            let (code, _) = rest.split_once('_')?;
            Some((code.to_string(), *column))
        })
        .collect()
});

static DIVISION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^Divisão:\s*(\d+|ZZ)\s*-\s*(.+)$").expect("division header pattern is valid")
});

/// Trims and collapses internal whitespace runs to a single space.
pub fn normalize_header(header: &str) -> String {
    header.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves a `Divisão: NN - ...` header to its amount column.
///
/// Codes outside the catalog map to a synthetic `divisao_<CODE>` key.
pub fn division_field(header: &str) -> Option<FieldId> {
    let captures = DIVISION_PATTERN.captures(header)?;
    let raw = captures.get(1)?.as_str();
    let code = if raw.chars().all(|c| c.is_ascii_digit()) && raw.len() < 2 {
        format!("0{raw}")
    } else {
        raw.to_ascii_lowercase()
    };
    let field = match DIVISION_COLUMNS.get(&code) {
        Some(column) => FieldId::amount(*column),
        None => FieldId::amount(format!("divisao_{code}")),
    };
    Some(field)
}

pub fn resolve_header(normalized: &str) -> Option<FieldId> {
    if let Some(field) = LABELS.get(normalized) {
        return Some(field.clone());
    }
    if let Some(field) = division_field(normalized) {
        return Some(field);
    }
    if normalized.contains("DIVISÃO: ZZ") || normalized.contains("ZZ - TOTAL ICMS") {
        return Some(FieldId::amount(ZZ_COLUMN));
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmappedHeader {
    pub index: usize,
    pub header: String,
    pub cleaned: String,
}

/// Column position to field identifier, built once per workbook.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeaderMapping {
    pub columns: BTreeMap<usize, FieldId>,
    pub unmapped: Vec<UnmappedHeader>,
    pub total_headers: usize,
}

impl HeaderMapping {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldId> {
        self.columns.get(&index)
    }

    /// Mapped headers over all header cells, empty cells included.
    pub fn coverage_percent(&self) -> f64 {
        if self.total_headers == 0 {
            return 0.0;
        }
        self.columns.len() as f64 / self.total_headers as f64 * 100.0
    }
}

pub fn build_header_mapping(header_row: &[String]) -> HeaderMapping {
    let mut mapping = HeaderMapping {
        total_headers: header_row.len(),
        ..Default::default()
    };

    for (index, header) in header_row.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        let cleaned = normalize_header(header);
        match resolve_header(&cleaned) {
            Some(field) => {
                mapping.columns.insert(index, field);
            }
            None => {
                warn!(index, header = %header, cleaned = %cleaned, "unmapped header");
                mapping.unmapped.push(UnmappedHeader {
                    index,
                    header: header.clone(),
                    cleaned,
                });
            }
        }
    }

    info!(
        mapped = mapping.len(),
        unmapped = mapping.unmapped.len(),
        total = mapping.total_headers,
        coverage = %format_args!("{:.1}%", mapping.coverage_percent()),
        "header mapping built"
    );
    mapping
}

fn parse_f64(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Integer-class coercion; anything non-numeric becomes 0.
pub fn parse_integer(cell: &Data) -> i32 {
    match cell {
        Data::Int(v) => i32::try_from(*v).unwrap_or(0),
        Data::Float(v) if v.is_finite() => *v as i32,
        Data::Bool(v) => i32::from(*v),
        Data::String(s) => {
            let s = s.trim();
            s.parse::<i32>()
                .ok()
                .or_else(|| parse_f64(s).map(|v| v as i32))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// Text-class coercion; whole floats are written without a fractional part.
pub fn parse_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => format!("{}", *v as i64),
        other => other.to_string().trim().to_string(),
    }
}

/// Monetary-class coercion to two decimal places, halves rounded away from
/// zero as NUMERIC(15,2) does; empty or non-numeric is `None`.
pub fn parse_amount(cell: &Data) -> Option<Decimal> {
    let value = match cell {
        Data::Int(v) => Some(Decimal::from(*v)),
        Data::Float(v) => Decimal::from_f64(*v),
        Data::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Decimal::from_str(s)
                    .ok()
                    .or_else(|| parse_f64(s).and_then(Decimal::from_f64))
            }
        }
        _ => None,
    };
    value.map(|v| v.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

pub fn coerce(cell: &Data, class: FieldClass) -> FieldValue {
    match class {
        FieldClass::Integer => FieldValue::Integer(parse_integer(cell)),
        FieldClass::Text => FieldValue::Text(parse_text(cell)),
        FieldClass::Monetary => FieldValue::Amount(parse_amount(cell)),
    }
}

/// Maps one data row. Returns `None` for rows missing region, period, year or
/// month, for months outside 1..=12 or years that are not four digits, and for
/// rows whose period disagrees with year and month.
pub fn map_row(row: &[Data], mapping: &HeaderMapping) -> Option<IcmsRecord> {
    let mut record = IcmsRecord::default();
    for (index, field) in &mapping.columns {
        let Some(cell) = row.get(*index) else {
            continue;
        };
        record.set_field(field, coerce(cell, field.class()));
    }

    if !record.has_identity() {
        return None;
    }
    if !record.period_in_range() || !record.period_matches() {
        debug!(
            region = %record.region,
            period = %record.period,
            year = record.year,
            month = record.month,
            "period out of range or inconsistent with year and month; row dropped"
        );
        return None;
    }
    Some(record)
}

fn is_blank(cell: &Data) -> bool {
    matches!(cell, Data::Empty) || matches!(cell, Data::String(s) if s.is_empty())
}

/// A row counts as data when any of its first three cells is filled.
pub fn is_data_row(row: &[Data]) -> bool {
    row.iter().take(3).any(|cell| !is_blank(cell))
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedWorkbook {
    pub sheet_name: String,
    pub mapping: HeaderMapping,
    pub records: Vec<IcmsRecord>,
    pub data_rows: usize,
    pub skipped_rows: usize,
}

pub trait SpreadsheetAdapter: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedWorkbook, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
pub struct IcmsWorkbookAdapter {
    pub header_row_index: usize,
}

impl Default for IcmsWorkbookAdapter {
    fn default() -> Self {
        Self {
            header_row_index: DEFAULT_HEADER_ROW_INDEX,
        }
    }
}

impl SpreadsheetAdapter for IcmsWorkbookAdapter {
    fn parse(&self, path: &Path) -> Result<ParsedWorkbook, AdapterError> {
        parse_workbook(path, self.header_row_index)
    }
}

/// Reads the first sheet of `path`. `header_row_index` is the absolute sheet
/// row holding the labels; every later row is a data candidate.
pub fn parse_workbook(path: &Path, header_row_index: usize) -> Result<ParsedWorkbook, AdapterError> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(AdapterError::NoSheets)?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let missing = || AdapterError::MissingHeaderRow {
        index: header_row_index,
    };
    // calamine ranges start at the first used cell, not at A1.
    let first_row = range.start().map(|(row, _)| row as usize).ok_or_else(missing)?;
    let header_offset = header_row_index.checked_sub(first_row).ok_or_else(missing)?;

    let mut rows = range.rows().skip(header_offset);
    let header_row: Vec<String> = rows
        .next()
        .ok_or_else(missing)?
        .iter()
        .map(parse_text)
        .collect();

    let mapping = build_header_mapping(&header_row);

    let mut records = Vec::new();
    let mut data_rows = 0usize;
    for row in rows.filter(|row| is_data_row(row)) {
        data_rows += 1;
        if let Some(record) = map_row(row, &mapping) {
            records.push(record);
        }
    }
    let skipped_rows = data_rows - records.len();

    info!(
        sheet = %sheet_name,
        data_rows,
        records = records.len(),
        skipped_rows,
        "workbook parsed"
    );

    Ok(ParsedWorkbook {
        sheet_name,
        mapping,
        records,
        data_rows,
        skipped_rows,
    })
}
