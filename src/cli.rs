use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::search::SourceFormat;

#[derive(Parser, Debug)]
#[command(author, version, about = "Semantic search over nutrition facts", long_about = None)]
pub struct Cli {
    /// Optional JSON settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a nutrition dataset and build the search index from it
    Import {
        /// Path to the dataset file
        #[arg(short, long)]
        source: PathBuf,

        #[arg(short, long, value_enum, default_value_t = FormatArg::Usda)]
        format: FormatArg,

        /// Rebuild even if an index already exists
        #[arg(long)]
        force: bool,
    },
    /// Find foods matching a description or a photo
    Search {
        /// Free-text description of the food
        #[arg(required_unless_present = "image")]
        query: Option<String>,

        /// Search with an image instead of text
        #[arg(long, conflicts_with = "query")]
        image: Option<PathBuf>,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long)]
        threshold: Option<f32>,

        /// Include macros and portions
        #[arg(long)]
        detail: bool,
    },
    /// Show the configured backend and what has been built
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// USDA FoodData Central Foundation Foods JSON
    Usda,
    /// Flat CSV (id, description, category, kcal/100g, protein, fat, carbs)
    Csv,
}

impl From<FormatArg> for SourceFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Usda => SourceFormat::Usda,
            FormatArg::Csv => SourceFormat::Csv,
        }
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_with_overrides() {
        let cli = Cli::try_parse_from(["nutri_search", "search", "tomato", "--limit", "3", "--detail"]).unwrap();
        match cli.command {
            Command::Search { query, limit, detail, image, threshold } => {
                assert_eq!(query.as_deref(), Some("tomato"));
                assert_eq!(limit, Some(3));
                assert!(detail);
                assert!(image.is_none());
                assert!(threshold.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_import_defaults_to_usda() {
        let cli = Cli::try_parse_from(["nutri_search", "import", "--source", "foods.json"]).unwrap();
        match cli.command {
            Command::Import { format, force, .. } => {
                assert_eq!(format, FormatArg::Usda);
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_search_needs_query_or_image() {
        assert!(Cli::try_parse_from(["nutri_search", "search"]).is_err());
        assert!(Cli::try_parse_from(["nutri_search", "search", "--image", "plate.jpg"]).is_ok());
    }
}
