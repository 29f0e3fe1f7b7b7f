//! Core domain model for ICMS collection ingestion.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "icms-core";

/// Amount columns persisted as NUMERIC(15,2), in table order.
pub const AMOUNT_COLUMNS: &[&str] = &[
    "ipva_total",
    "itcmd_total",
    "taxa_total",
    "outras_receitas_tributarias",
    "total_outros_tributos",
    "divida_ativa_icms",
    "divida_ativa_ipva",
    "divida_ativa_itcmd",
    "total_dividas_ativas",
    "secao_a_agricultura",
    "divisao_01_agricultura_pecuaria",
    "divisao_02_producao_florestal",
    "divisao_03_pesca_aquicultura",
    "secao_b_industrias_extrativas",
    "divisao_05_extracao_carvao",
    "divisao_06_extracao_petroleo_gas",
    "divisao_07_extracao_minerais_metalicos",
    "divisao_08_extracao_minerais_nao_metalicos",
    "divisao_09_apoio_extracao_minerais",
    "secao_c_industrias_transformacao",
    "divisao_10_produtos_alimenticios",
    "divisao_11_bebidas",
    "divisao_12_produtos_fumo",
    "divisao_13_produtos_texteis",
    "divisao_14_vestuario_acessorios",
    "divisao_15_couros_calcados",
    "divisao_16_produtos_madeira",
    "divisao_17_celulose_papel",
    "divisao_18_impressao_gravacoes",
    "divisao_19_coque_petroleo_biocombustiveis",
    "divisao_20_produtos_quimicos",
    "divisao_21_farmoquimicos_farmaceuticos",
    "divisao_22_borracha_plastico",
    "divisao_23_minerais_nao_metalicos",
    "divisao_24_metalurgia",
    "divisao_25_produtos_metal",
    "divisao_26_equipamentos_informatica",
    "divisao_27_maquinas_eletricas",
    "divisao_28_maquinas_equipamentos",
    "divisao_29_veiculos_automotores",
    "divisao_30_outros_equipamentos_transporte",
    "divisao_31_moveis",
    "divisao_32_produtos_diversos",
    "divisao_33_manutencao_reparacao",
    "secao_d_eletricidade_gas",
    "divisao_35_eletricidade_gas_utilidades",
    "secao_e_agua_esgoto_residuos",
    "divisao_36_agua",
    "divisao_37_esgoto",
    "divisao_38_residuos",
    "divisao_39_descontaminacao",
    "secao_f_construcao",
    "divisao_41_construcao_edificios",
    "divisao_42_obras_infraestrutura",
    "divisao_43_servicos_especializados_construcao",
    "secao_g_comercio",
    "divisao_45_comercio_veiculos",
    "divisao_46_comercio_atacado",
    "divisao_47_comercio_varejista",
    "secao_h_transporte",
    "divisao_49_transporte_terrestre",
    "divisao_50_transporte_aquaviario",
    "divisao_51_transporte_aereo",
    "divisao_52_armazenamento",
    "divisao_53_correio",
    "secao_i_alojamento_alimentacao",
    "divisao_55_alojamento",
    "divisao_56_alimentacao",
    "secao_j_informacao_comunicacao",
    "divisao_58_edicao",
    "divisao_59_atividades_cinematograficas",
    "divisao_60_radio_televisao",
    "divisao_61_telecomunicacoes",
    "divisao_62_tecnologia_informacao",
    "divisao_63_servicos_informacao",
    "secao_k_atividades_financeiras",
    "divisao_64_servicos_financeiros",
    "divisao_65_seguros_previdencia",
    "divisao_66_auxiliares_financeiros",
    "secao_l_atividades_imobiliarias",
    "divisao_68_atividades_imobiliarias",
    "secao_m_atividades_profissionais",
    "divisao_69_juridicas_contabilidade",
    "divisao_70_sedes_empresas_consultoria",
    "divisao_71_arquitetura_engenharia",
    "divisao_72_pesquisa_desenvolvimento",
    "divisao_73_publicidade_pesquisa_mercado",
    "divisao_74_outras_atividades_profissionais",
    "divisao_75_atividades_veterinarias",
    "secao_n_atividades_administrativas",
    "divisao_77_alugueis_nao_imobiliarios",
    "divisao_78_selecao_agenciamento_locacao",
    "divisao_79_agencias_viagens",
    "divisao_80_vigilancia_seguranca",
    "divisao_81_servicos_edificios",
    "divisao_82_servicos_escritorio_apoio",
    "secao_o_administracao_publica",
    "divisao_84_administracao_publica_defesa",
    "secao_p_educacao",
    "divisao_85_educacao",
    "secao_q_saude_servicos_sociais",
    "divisao_86_atencao_saude_humana",
    "divisao_87_saude_assistencia_social",
    "divisao_88_assistencia_social_sem_alojamento",
    "secao_r_artes_cultura_esporte",
    "divisao_90_atividades_artisticas",
    "divisao_91_patrimonio_cultural_ambiental",
    "divisao_92_jogos_azar_apostas",
    "divisao_93_esportivas_recreacao",
    "secao_s_outras_atividades_servicos",
    "divisao_94_organizacoes_associativas",
    "divisao_95_reparacao_manutencao_objetos",
    "divisao_96_outras_atividades_servicos_pessoais",
    "secao_t_servicos_domesticos",
    "divisao_97_servicos_domesticos",
    "secao_u_organismos_internacionais",
    "divisao_99_organismos_internacionais",
    "secao_zz_cnae_nao_identificado",
    "divisao_zz_cnae_nao_identificado",
    "total_icms",
    "total_icms_outros_tributos",
];

pub fn is_catalog_column(column: &str) -> bool {
    AMOUNT_COLUMNS.contains(&column)
}

/// Storage class of a field, which decides how a raw cell is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Integer,
    Text,
    Monetary,
}

/// Canonical identifier of a spreadsheet column.
///
/// `Amount` carries a snake_case column name: either one of [`AMOUNT_COLUMNS`]
/// or a synthetic `divisao_<CODE>` key for divisions missing from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldId {
    RegionId,
    Region,
    Period,
    Year,
    Month,
    Amount(String),
}

impl FieldId {
    pub fn amount(column: impl Into<String>) -> Self {
        Self::Amount(column.into())
    }

    pub fn class(&self) -> FieldClass {
        match self {
            Self::RegionId | Self::Year | Self::Month => FieldClass::Integer,
            Self::Region | Self::Period => FieldClass::Text,
            Self::Amount(_) => FieldClass::Monetary,
        }
    }

    pub fn column_name(&self) -> &str {
        match self {
            Self::RegionId => "id_uf",
            Self::Region => "uf",
            Self::Period => "periodo",
            Self::Year => "ano",
            Self::Month => "mes",
            Self::Amount(column) => column,
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// A coerced cell value, tagged with the class it was coerced for.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i32),
    Text(String),
    Amount(Option<Decimal>),
}

/// One region/period observation from the collection bulletin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IcmsRecord {
    pub region_id: i32,
    pub region: String,
    pub period: String,
    pub year: i32,
    pub month: i32,
    /// Mapped monetary columns. `None` means the source cell held no data.
    pub amounts: BTreeMap<String, Option<Decimal>>,
}

impl IcmsRecord {
    /// Typed setter keyed by field identifier. Returns `false` when the value
    /// class does not match the field class and nothing was written.
    pub fn set_field(&mut self, field: &FieldId, value: FieldValue) -> bool {
        match (field, value) {
            (FieldId::RegionId, FieldValue::Integer(v)) => self.region_id = v,
            (FieldId::Year, FieldValue::Integer(v)) => self.year = v,
            (FieldId::Month, FieldValue::Integer(v)) => self.month = v,
            (FieldId::Region, FieldValue::Text(v)) => self.region = v,
            (FieldId::Period, FieldValue::Text(v)) => self.period = v,
            (FieldId::Amount(column), FieldValue::Amount(v)) => {
                self.amounts.insert(column.clone(), v);
            }
            _ => return false,
        }
        true
    }

    pub fn amount(&self, column: &str) -> Option<Decimal> {
        self.amounts.get(column).copied().flatten()
    }

    /// Amounts whose key has no dedicated storage column.
    pub fn extra_amounts(&self) -> BTreeMap<String, Option<Decimal>> {
        self.amounts
            .iter()
            .filter(|(column, _)| !is_catalog_column(column))
            .map(|(column, value)| (column.clone(), *value))
            .collect()
    }

    /// Mandatory identification fields are present.
    pub fn has_identity(&self) -> bool {
        !self.region.is_empty() && !self.period.is_empty() && self.year != 0 && self.month != 0
    }

    /// `period == year * 100 + month`.
    pub fn period_matches(&self) -> bool {
        self.period.parse::<i64>().ok() == Some(i64::from(self.year) * 100 + i64::from(self.month))
    }

    /// Four-digit year and a calendar month.
    pub fn period_in_range(&self) -> bool {
        (1000..=9999).contains(&self.year) && (1..=12).contains(&self.month)
    }

    pub fn is_valid(&self) -> bool {
        self.has_identity() && self.period_in_range() && self.period_matches()
    }
}

/// Formats a zero-padded `YYYYMM` period as `MM/YYYY`.
pub fn period_display(period: &str) -> Option<String> {
    if period.len() != 6 || !period.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = period[..4].parse().ok()?;
    let month: u32 = period[4..].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(date.format("%m/%Y").to_string())
}

/// Earliest and latest period of `records`, formatted as `MM/YYYY`.
///
/// Periods are compared as strings; they are zero-padded so lexicographic
/// order is chronological. With no usable period both ends fall back to `today`.
pub fn period_range(records: &[IcmsRecord], today: NaiveDate) -> (String, String) {
    let periods: BTreeSet<&str> = records.iter().map(|r| r.period.as_str()).collect();
    let fallback = today.format("%m/%Y").to_string();
    let first = periods.first().and_then(|p| period_display(p));
    let last = periods.last().and_then(|p| period_display(p));
    (
        first.unwrap_or_else(|| fallback.clone()),
        last.unwrap_or(fallback),
    )
}

pub fn distinct_periods(records: &[IcmsRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.period.clone()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingMethod {
    Incremental,
    TruncateAndLoad,
}

impl ProcessingMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Incremental => "Incremental",
            Self::TruncateAndLoad => "Truncate and Load",
        }
    }
}

impl FromStr for ProcessingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match normalized.as_str() {
            "incremental" => Ok(Self::Incremental),
            "truncateandload" | "truncate" | "full" => Ok(Self::TruncateAndLoad),
            _ => Err(format!("unknown processing method: {s}")),
        }
    }
}

/// How a run was started; shown in the report subject and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Scheduled,
    Forced,
}

impl ExecutionMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scheduled => "Agendado",
            Self::Forced => "Forçado",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::Scheduled => "⏰",
            Self::Forced => "🚀",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Success,
    Failure,
}

impl LoadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "Sucesso",
            Self::Failure => "Falha",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub record_index: usize,
    pub month: i32,
    pub year: i32,
    pub region: String,
    pub status: LoadStatus,
}

/// Per-record load outcomes for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry per record of a batch starting at `offset` in the load input.
    pub fn record_batch(&mut self, offset: usize, batch: &[IcmsRecord], status: LoadStatus) {
        self.entries
            .extend(batch.iter().enumerate().map(|(i, record)| LedgerEntry {
                record_index: offset + i,
                month: record.month,
                year: record.year,
                region: record.region.clone(),
                status,
            }));
    }

    /// Marks every entry as failed and fills in entries for records that never
    /// got one, leaving exactly one entry per input record.
    pub fn fail_all(&mut self, records: &[IcmsRecord]) {
        let mut seen = vec![false; records.len()];
        self.entries.retain(|entry| {
            match seen.get_mut(entry.record_index) {
                Some(slot) if !*slot => {
                    *slot = true;
                    true
                }
                _ => false,
            }
        });
        for entry in &mut self.entries {
            entry.status = LoadStatus::Failure;
        }
        for (index, record) in records.iter().enumerate() {
            if !seen[index] {
                self.entries.push(LedgerEntry {
                    record_index: index,
                    month: record.month,
                    year: record.year,
                    region: record.region.clone(),
                    status: LoadStatus::Failure,
                });
            }
        }
        self.sort();
    }

    pub fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.record_index);
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.count(LoadStatus::Success)
    }

    pub fn failure_count(&self) -> usize {
        self.count(LoadStatus::Failure)
    }

    fn count(&self, status: LoadStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Sorted distinct region codes.
    pub fn regions(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.region.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Statistics and outcomes of one pipeline run, consumed by the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processing_method: ProcessingMethod,
    pub period_start: String,
    pub period_end: String,
    pub elapsed_secs: u64,
    pub total_records: usize,
    pub selected_records: usize,
    pub successes: usize,
    pub failures: usize,
    pub ledger: Ledger,
    pub run_dir: String,
    pub load_error: Option<String>,
}

impl RunSummary {
    /// Rounded success percentage over ledger entries; 0 for an empty ledger.
    pub fn success_rate_percent(&self) -> u32 {
        if self.ledger.is_empty() {
            return 0;
        }
        ((self.successes as f64 / self.ledger.len() as f64) * 100.0).round() as u32
    }

    pub fn elapsed_minutes(&self) -> u64 {
        (self.elapsed_secs as f64 / 60.0).round() as u64
    }

    pub fn regions(&self) -> Vec<String> {
        self.ledger.regions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(region: &str, year: i32, month: i32) -> IcmsRecord {
        IcmsRecord {
            region_id: 1,
            region: region.to_string(),
            period: format!("{year:04}{month:02}"),
            year,
            month,
            amounts: BTreeMap::new(),
        }
    }

    #[test]
    fn catalog_has_unique_columns() {
        let unique: BTreeSet<_> = AMOUNT_COLUMNS.iter().collect();
        assert_eq!(unique.len(), AMOUNT_COLUMNS.len());
        assert_eq!(AMOUNT_COLUMNS.len(), 121);
    }

    #[test]
    fn typed_setter_rejects_class_mismatch() {
        let mut r = IcmsRecord::default();
        assert!(r.set_field(&FieldId::Year, FieldValue::Integer(2023)));
        assert!(!r.set_field(&FieldId::Year, FieldValue::Text("2023".into())));
        assert!(r.set_field(&FieldId::amount("ipva_total"), FieldValue::Amount(Some(Decimal::new(1050, 2)))));
        assert_eq!(r.year, 2023);
        assert_eq!(r.amount("ipva_total"), Some(Decimal::new(1050, 2)));
    }

    #[test]
    fn null_amount_differs_from_zero() {
        let mut r = IcmsRecord::default();
        r.set_field(&FieldId::amount("ipva_total"), FieldValue::Amount(None));
        r.set_field(&FieldId::amount("itcmd_total"), FieldValue::Amount(Some(Decimal::ZERO)));
        assert_eq!(r.amount("ipva_total"), None);
        assert_eq!(r.amount("itcmd_total"), Some(Decimal::ZERO));
    }

    #[test]
    fn extra_amounts_only_holds_synthetic_keys() {
        let mut r = IcmsRecord::default();
        r.set_field(&FieldId::amount("total_icms"), FieldValue::Amount(Some(Decimal::ONE)));
        r.set_field(&FieldId::amount("divisao_04"), FieldValue::Amount(Some(Decimal::TWO)));
        let extras = r.extra_amounts();
        assert_eq!(extras.len(), 1);
        assert_eq!(extras.get("divisao_04"), Some(&Some(Decimal::TWO)));
    }

    #[test]
    fn validity_requires_consistent_period() {
        assert!(record("ES", 2023, 1).is_valid());
        let mut r = record("ES", 2023, 1);
        r.period = "202302".into();
        assert!(r.has_identity());
        assert!(!r.is_valid());
        let mut r = record("ES", 2023, 1);
        r.region.clear();
        assert!(!r.is_valid());
    }

    #[test]
    fn validity_requires_calendar_month_and_four_digit_year() {
        let month_13 = record("ES", 2023, 13);
        assert_eq!(month_13.period, "202313");
        assert!(month_13.period_matches());
        assert!(!month_13.is_valid());
        assert!(!record("ES", 999, 12).is_valid());
        assert!(record("ES", 2023, 12).is_valid());
    }

    #[test]
    fn period_range_uses_lexicographic_order() {
        let records = vec![record("SP", 2023, 11), record("ES", 2021, 3), record("RJ", 2022, 12)];
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(
            period_range(&records, today),
            ("03/2021".to_string(), "11/2023".to_string())
        );
        assert_eq!(
            period_range(&[], today),
            ("10/2026".to_string(), "10/2026".to_string())
        );
    }

    #[test]
    fn fail_all_leaves_one_failure_per_record() {
        let records: Vec<_> = (1..=5).map(|m| record("ES", 2023, m)).collect();
        let mut ledger = Ledger::new();
        ledger.record_batch(0, &records[..2], LoadStatus::Success);
        ledger.record_batch(2, &records[2..4], LoadStatus::Failure);
        ledger.fail_all(&records);
        assert_eq!(ledger.len(), 5);
        assert_eq!(ledger.failure_count(), 5);
        assert_eq!(ledger.success_count(), 0);
        let indexes: Vec<_> = ledger.entries().iter().map(|e| e.record_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn processing_method_parses_env_spellings() {
        assert_eq!("Incremental".parse(), Ok(ProcessingMethod::Incremental));
        assert_eq!("Truncate and Load".parse(), Ok(ProcessingMethod::TruncateAndLoad));
        assert_eq!("truncate_and_load".parse(), Ok(ProcessingMethod::TruncateAndLoad));
        assert!("sometimes".parse::<ProcessingMethod>().is_err());
    }

    #[test]
    fn success_rate_handles_empty_ledger() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            processing_method: ProcessingMethod::Incremental,
            period_start: "01/2023".into(),
            period_end: "01/2023".into(),
            elapsed_secs: 89,
            total_records: 0,
            selected_records: 0,
            successes: 0,
            failures: 0,
            ledger: Ledger::new(),
            run_dir: String::new(),
            load_error: None,
        };
        assert_eq!(summary.success_rate_percent(), 0);
        assert_eq!(summary.elapsed_minutes(), 1);
    }
}
