use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::filter::FilterOptions;
use crate::parser::gazette::DEFAULT_GRANT_CODE;
use crate::parser::ExtractOptions;

const ENV_PREFIX: &str = "GAZETTE";
const DEFAULT_FILE: &str = "gazette";
const LIST_KEYS: [&str; 4] = ["csv_encodings", "default_classes", "default_keywords", "extra_keywords"];

const DEFAULT_CLASSES: &[&str] = &["3", "8", "9", "11", "12", "14", "16", "18", "20", "21", "24", "28", "35"];

const DEFAULT_KEYWORDS: &[&str] = &[
    "telefone", "celular", "computador", "iluminação", "utensílios", "elétricos", "jogos", "brinquedos",
    "imagem", "som", "eletricidade", "ferramentas", "canecas", "garrafas", "elétricas", "ferramentas manuais",
    "cutelaria", "recipientes", "cosméticos", "Kits educacionais", "papelaria", "etiquetas", "embalagens",
    "papel", "artigos", "material", "sacolas", "preparações", "produtos", "substâncias", "cosméticas",
    "máquinas", "amortecedor", "motor", "aparelho", "bobina", "bomba", "cabeçote", "veículo", "dispositivos",
    "Instrumentos", "bolsa", "bolsas", "malas", "couro", "mochilas", "nécessaires", "móveis", "almofadas",
    "apoio", "armários", "bancada", "bebê", "camas", "canis", "mobiliário", "animais", "animal", "metálicos",
    "metálicas", "mesas", "mobília", "metal", "têxtil", "tecido", "toalha", "cama", "malha", "mantas",
    "panos", "pano", "metais", "joias", "bijuterias", "relojoaria", "Caixas", "relógio", "Joia", "ouro",
    "pérolas", "pedras", "prata",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database_path: PathBuf,
    pub archive_dir: PathBuf,
    /// Dispatch code that marks a process as granted.
    pub grant_dispatch_code: String,
    pub csv_delimiter: String,
    /// Tried in order when decoding CSV input.
    pub csv_encodings: Vec<String>,
    pub default_classes: Vec<String>,
    pub default_keywords: Vec<String>,
    /// Added to `default_keywords` for every run.
    pub extra_keywords: Vec<String>,
    pub insert_batch_size: usize,
    pub query_page_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Settings {
            database_path: PathBuf::from("data/gazette.sqlite"),
            archive_dir: PathBuf::from("data/archive"),
            grant_dispatch_code: DEFAULT_GRANT_CODE.to_string(),
            csv_delimiter: ";".to_string(),
            csv_encodings: strings(&["utf-8", "latin-1", "iso-8859-1", "cp1252"]),
            default_classes: strings(DEFAULT_CLASSES),
            default_keywords: strings(DEFAULT_KEYWORDS),
            extra_keywords: Vec::new(),
            insert_batch_size: 100,
            query_page_size: 1000,
        }
    }
}

impl Settings {
    /// Defaults, then `gazette.toml` (or the given file), then `GAZETTE_*`
    /// environment variables. List values in the environment are
    /// comma-separated.
    pub fn load(file: Option<&Path>) -> Result<Settings> {
        Self::load_with_env(file, None)
    }

    fn load_with_env(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Settings> {
        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .source(env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let file_source = match file {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file_source)
            .add_source(environment)
            .build()
            .context("Failed to load settings")?
            .try_deserialize()
            .context("Invalid settings")?;
        Ok(settings)
    }

    pub fn extract_options(&self) -> Result<ExtractOptions> {
        let delimiter = match self.csv_delimiter.as_bytes() {
            [b] if b.is_ascii() => *b,
            _ => bail!("csv_delimiter must be a single ASCII character, got {:?}", self.csv_delimiter),
        };
        if self.grant_dispatch_code.trim().is_empty() {
            bail!("grant_dispatch_code is empty");
        }
        Ok(ExtractOptions {
            grant_code: self.grant_dispatch_code.trim().to_string(),
            csv_delimiter: delimiter,
            csv_encodings: self.csv_encodings.clone(),
        })
    }

    /// Default classes plus default and extra keywords, deduplicated
    /// case-insensitively.
    pub fn default_filters(&self) -> FilterOptions {
        FilterOptions {
            classes: self.default_classes.clone(),
            keywords: merge_keywords(&self.default_keywords, &self.extra_keywords),
        }
    }
}

pub fn merge_keywords(base: &[String], extra: &[String]) -> Vec<String> {
    base.iter()
        .chain(extra)
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .unique_by(|k| k.to_lowercase())
        .map(str::to_string)
        .collect()
}
