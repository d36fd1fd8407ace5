use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use crate::container::{ContainerFilter, ContainerStatus, ListQuery};

/// Container lifecycle administration and uptime analytics.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "container-adm.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume status messages from Kafka until SIGINT or SIGTERM.
    Consume,
    /// Start a container and record it.
    Create { name: String, image: String },
    /// Change a container's image, status or runtime id.
    Update {
        id: i64,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Raw field update, e.g. `--set image_name=nginx:1.27`. Repeatable.
        #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Stop, remove and forget a container.
    Delete { id: i64 },
    /// List containers.
    List(ListArgs),
    /// Start and record every row of a JSON file: `[{"name": .., "image": ..}]`.
    Import { file: PathBuf },
    /// Write the selected containers as JSON.
    Export {
        #[command(flatten)]
        list: ListArgs,
        /// Output file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Append a status event for a container.
    RecordStatus { id: i64, status: String },
    /// Average share of running events per container in a window.
    UptimeRatio {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Running time per container in a window.
    UptimeDuration {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Container counts and names.
    Stats,
}

#[derive(clap::Args, Debug, Default)]
pub struct ListArgs {
    #[arg(long)]
    pub container_id: Option<String>,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub image: Option<String>,
    #[arg(long)]
    pub status: Option<ContainerStatus>,
    #[arg(long, default_value_t = 0)]
    pub from: i64,
    #[arg(long, default_value_t = 0)]
    pub to: i64,
    #[arg(long)]
    pub sort_by: Option<String>,
    #[arg(long)]
    pub sort_order: Option<String>,
}

impl ListArgs {
    pub fn to_query(&self) -> ListQuery {
        ListQuery {
            filter: ContainerFilter {
                runtime_id: self.container_id.clone(),
                name: self.name.clone(),
                image: self.image.clone(),
                status: self.status,
            },
            from: self.from,
            to: self.to,
            sort_by: self.sort_by.clone(),
            sort_order: self.sort_order.clone(),
        }
    }
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected FIELD=VALUE, got {raw}"))
}

/// Collect the update flags into the field map a patch is validated from.
pub fn update_fields(
    image: Option<String>,
    status: Option<String>,
    fields: Vec<(String, String)>,
) -> Map<String, Value> {
    let mut map: Map<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    if let Some(image) = image {
        map.insert("image_name".to_string(), Value::String(image));
    }
    if let Some(status) = status {
        map.insert("status".to_string(), Value::String(status));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_flags_become_fields() {
        let args = Args::try_parse_from([
            "container-adm",
            "update",
            "42",
            "--status",
            "stopped",
            "--set",
            "container_id=abc",
        ])
        .unwrap();
        let Command::Update {
            id,
            image,
            status,
            fields,
        } = args.command
        else {
            panic!("expected update");
        };
        assert_eq!(id, 42);
        let map = update_fields(image, status, fields);
        assert_eq!(map["status"], "stopped");
        assert_eq!(map["container_id"], "abc");
        assert!(!map.contains_key("image_name"));
    }

    #[test]
    fn test_list_args_to_query() {
        let args = Args::try_parse_from([
            "container-adm",
            "list",
            "--status",
            "running",
            "--sort-by",
            "container_name",
            "--to",
            "5",
        ])
        .unwrap();
        let Command::List(list) = args.command else {
            panic!("expected list");
        };
        let query = list.to_query();
        assert_eq!(query.filter.status, Some(ContainerStatus::Running));
        assert_eq!(query.page_size(), 5);
        assert_eq!(query.sort_by.as_deref(), Some("container_name"));
    }

    #[test]
    fn test_uptime_window_parses_rfc3339() {
        let args = Args::try_parse_from([
            "container-adm",
            "uptime-ratio",
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-01-02T00:00:00Z",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::UptimeRatio { .. }));
    }

    #[test]
    fn test_bad_field_is_rejected() {
        assert!(
            Args::try_parse_from(["container-adm", "update", "1", "--set", "status"]).is_err()
        );
    }
}
