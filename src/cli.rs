//! CLI module - Command-line interface definitions and handlers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::backends::process::ShellRunner;
use crate::backends::psql::{Query, TableRef};
use crate::cache::store::{render_template, CacheStore};
use crate::core::config::Config;
use crate::core::model::Schema;
use crate::core::render::{OutputFormat, RenderConfig, Renderer};
use crate::core::table::DecodeOptions;
use crate::core::template::parse_params;
use crate::core::util::{generate_key, HashAlgorithm};

/// qcache - cache psql query results on disk, keyed by name, with their column types.
#[derive(Parser, Debug)]
#[command(name = "qcache")]
#[command(
    author,
    version,
    about,
    long_about = r#"qcache runs a SQL query through psql once per cache key and keeps the
result as <key>.csv.gz next to a <key>.json schema side-car. Later fetches with
the same key are answered from disk with the original column types.

Output formats for tables:
- jsonl: one JSON object per row (default)
- json: a single JSON array
- csv: headered CSV
- md: Markdown table

Examples:
    qcache fetch --key daily --sql "SELECT * FROM test.customer_reviews"
    qcache fetch --key by_year --template sql/by_year.sql --param year=1999
    qcache load data/customer_reviews.csv test.customer_reviews
    qcache list
"#
)]
pub struct Cli {
    /// Configuration file (TOML).
    #[arg(
        long,
        global = true,
        env = "QCACHE_CONFIG",
        value_name = "FILE",
        long_help = "Configuration file with [connection] and [system] sections.\n\n\
If omitted, ./qcache.toml is used when present; otherwise built-in defaults apply."
    )]
    pub config: Option<PathBuf>,

    /// Override the cache directory.
    #[arg(long, global = true, env = "QCACHE_CACHE_DIR", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Override the psql executable.
    #[arg(long, global = true, env = "QCACHE_PSQL", value_name = "PATH")]
    pub psql: Option<String>,

    /// Output format (jsonl/json/csv/md).
    #[arg(
        long,
        global = true,
        default_value = "jsonl",
        value_name = "FORMAT",
        long_help = "Select the output format for tables.\n\n\
Supported values:\n\
- jsonl (default)\n\
- json\n\
- csv\n\
- md (markdown)\n\n\
Listings (list, doctor) are printed as jsonl unless json is selected."
    )]
    pub format: String,

    /// Pretty-print JSON/JSONL output with indentation.
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Quiet mode (errors only on stderr).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (cache hits, misses and commands on stderr).
    #[arg(
        short,
        long,
        global = true,
        long_help = "Log cache decisions and the commands being run to stderr.\n\
RUST_LOG takes precedence when set."
    )]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the SQL comes from
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct QuerySource {
    /// Inline SQL statement.
    #[arg(long, value_name = "SQL")]
    pub sql: Option<String>,

    /// File containing SQL.
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// SQL template with {name} placeholders, filled from --param.
    #[arg(long, value_name = "FILE")]
    pub template: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Return a query result, running the query only if KEY is not cached.
    #[command(
        long_about = "Look up KEY in the cache directory. If both <KEY>.csv.gz and <KEY>.json\n\
exist, the cached rows are decoded with the stored schema and printed; the query is\n\
not run and --schema is ignored.\n\n\
Otherwise the query is exported with psql, compressed, decoded and stored together\n\
with its schema (from --schema, or inferred from the data).\n\n\
Examples:\n\
  qcache fetch --key k1 --sql \"SELECT id, name FROM users\"\n\
  qcache fetch --key k2 --file report.sql --schema '{\"id\":\"integer\",\"name\":\"text\"}'\n\
  qcache fetch --key k3 --template by_year.sql --param year=1999 --parse-dates review_date\n"
    )]
    Fetch {
        /// Cache key.
        #[arg(long, value_name = "KEY")]
        key: String,

        #[command(flatten)]
        source: QuerySource,

        /// Template parameter (repeatable).
        #[arg(long = "param", value_name = "NAME=VALUE", requires = "template")]
        params: Vec<String>,

        /// Column types as a JSON object, used on a miss.
        #[arg(long, value_name = "JSON", conflicts_with = "schema_file")]
        schema: Option<String>,

        /// Column types from a JSON file, used on a miss.
        #[arg(long, value_name = "FILE")]
        schema_file: Option<PathBuf>,

        /// Columns to read as timestamps when inferring types.
        #[arg(long, value_name = "COLUMNS", value_delimiter = ',')]
        parse_dates: Vec<String>,

        /// The query output has no header row.
        #[arg(long)]
        no_header: bool,

        /// Column names for headerless output.
        #[arg(long, value_name = "COLUMNS", value_delimiter = ',', requires = "no_header")]
        names: Vec<String>,
    },

    /// Run SQL without caching and print psql's output.
    Exec {
        #[command(flatten)]
        source: QuerySource,

        /// Template parameter (repeatable).
        #[arg(long = "param", value_name = "NAME=VALUE", requires = "template")]
        params: Vec<String>,
    },

    /// Bulk-load a local CSV file into a table with \copy.
    #[command(
        long_about = "Load CSV_FILE into TARGET (schema.table or table) using psql's \\copy.\n\
Nothing is cached; every call loads again.\n\n\
Example:\n\
  qcache load tmp/customer_reviews.csv test.customer_reviews\n"
    )]
    Load {
        /// Local CSV file without header.
        #[arg(value_name = "CSV_FILE")]
        csv_file: PathBuf,

        /// Destination table.
        #[arg(value_name = "TARGET")]
        target: String,
    },

    /// Print a rendered SQL template.
    Render {
        /// SQL template with {name} placeholders.
        #[arg(value_name = "TEMPLATE")]
        template: PathBuf,

        /// Template parameter (repeatable).
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
    },

    /// Generate a new cache key from the current time.
    Key {
        /// Digest used for the key (sha1/xxh3).
        #[arg(long, default_value = "sha1", value_name = "ALGO")]
        algorithm: String,
    },

    /// Print the stored schema of a cache key.
    Schema {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// List cache entries and their state.
    List,

    /// Delete the cached data and schema of a key.
    Forget {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Check the psql client and cache directory.
    Doctor,
}

/// A query source after argument parsing
enum Source {
    Query(Query),
    Template(PathBuf, BTreeMap<String, String>),
}

impl QuerySource {
    fn resolve(self, params: &[String]) -> Result<Source> {
        if let Some(sql) = self.sql {
            return Ok(Source::Query(Query::Sql(sql)));
        }
        if let Some(file) = self.file {
            return Ok(Source::Query(Query::File(file)));
        }
        match self.template {
            Some(template) => {
                let params = parse_params(params).map_err(anyhow::Error::msg)?;
                Ok(Source::Template(template, params))
            }
            None => anyhow::bail!("one of --sql, --file or --template is required"),
        }
    }
}

fn explicit_schema(json: Option<&str>, file: Option<&PathBuf>) -> Result<Option<Schema>> {
    let text = match (json, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(file)) => fs::read_to_string(file)
            .with_context(|| format!("Failed to read schema file: {:?}", file))?,
        (None, None) => return Ok(None),
    };
    let schema = serde_json::from_str(&text).context("Invalid schema JSON")?;
    Ok(Some(schema))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::discover(cli.config.as_deref())?;
    if let Some(dir) = &cli.cache_dir {
        config.system.cache_dir = dir.clone();
    }
    if let Some(psql) = &cli.psql {
        config.system.client = psql.clone();
    }
    Ok(config)
}

/// Run the CLI with parsed arguments
pub fn run(cli: Cli) -> Result<()> {
    let format: OutputFormat = cli.format.parse().unwrap_or_default();
    let render_config = RenderConfig::with_pretty(format, cli.pretty);
    let renderer = Renderer::with_config(render_config);

    let config = load_config(&cli)?;
    let store = CacheStore::new(&config, ShellRunner);

    match cli.command {
        Commands::Fetch {
            key,
            source,
            params,
            schema,
            schema_file,
            parse_dates,
            no_header,
            names,
        } => {
            let explicit = explicit_schema(schema.as_deref(), schema_file.as_ref())?;
            let options = DecodeOptions {
                header: !no_header,
                names,
                parse_dates,
                ..Default::default()
            };
            let table = match source.resolve(&params)? {
                Source::Query(query) => store.fetch(&query, &key, explicit.as_ref(), &options)?,
                Source::Template(template, params) => {
                    store.fetch_template(&template, &params, &key, explicit.as_ref(), &options)?
                }
            };
            println!("{}", renderer.render_table(&table)?);
        }

        Commands::Exec { source, params } => {
            let output = match source.resolve(&params)? {
                Source::Query(query) => store.execute(&query)?,
                Source::Template(template, params) => store.execute_template(&template, &params)?,
            };
            println!("{}", output);
        }

        Commands::Load { csv_file, target } => {
            let target: TableRef = target.parse().map_err(anyhow::Error::msg)?;
            println!("{}", store.store(&csv_file, &target)?);
        }

        Commands::Render { template, params } => {
            let params = parse_params(&params).map_err(anyhow::Error::msg)?;
            println!("{}", render_template(&template, &params)?);
        }

        Commands::Key { algorithm } => {
            let algorithm: HashAlgorithm = algorithm.parse().map_err(anyhow::Error::msg)?;
            println!("{}", generate_key(algorithm));
        }

        Commands::Schema { key } => {
            let schema = store.schema_of(&key)?;
            let json = if cli.pretty {
                serde_json::to_string_pretty(&schema)?
            } else {
                serde_json::to_string(&schema)?
            };
            println!("{}", json);
        }

        Commands::List => {
            let entries = store.entries()?;
            println!("{}", renderer.render_records(&entries));
        }

        Commands::Forget { key } => {
            let removed = store.forget(&key)?;
            let record = serde_json::json!({ "key": key, "removed": removed });
            println!("{}", renderer.render_records(&[record]));
        }

        Commands::Doctor => crate::backends::doctor::run_doctor(&config, render_config)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_requires_a_query_source() {
        let result = Cli::try_parse_from(["qcache", "fetch", "--key", "k"]);
        assert!(result.is_err());

        let result = Cli::try_parse_from(["qcache", "fetch", "--key", "k", "--sql", "a", "--file", "b"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_param_requires_template() {
        let result = Cli::try_parse_from(["qcache", "exec", "--sql", "SELECT 1", "--param", "a=1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_fetch_parses_lists() {
        let cli = Cli::try_parse_from([
            "qcache",
            "fetch",
            "--key",
            "k",
            "--sql",
            "SELECT 1",
            "--parse-dates",
            "a,b",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch { parse_dates, .. } => assert_eq!(parse_dates, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_explicit_schema_keeps_order() {
        let schema = explicit_schema(Some(r#"{"z":"text","a":"integer"}"#), None)
            .unwrap()
            .unwrap();
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["z", "a"]);
        assert!(explicit_schema(Some("{"), None).is_err());
        assert!(explicit_schema(None, None).unwrap().is_none());
    }
}
