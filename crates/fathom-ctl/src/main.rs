//! fathom-ctl — command-line interface for a running sonar server.

use anyhow::{bail, Context, Result};

use fathom_core::config::ClientConfig;
use fathom_core::rpc::ParamValue;
use fathom_net::SonarClient;

fn print_usage() {
    println!("Usage: fathom-ctl [--host <host>] [--port <port>] <command>");
    println!();
    println!("Commands");
    println!("  version                        Check the server speaks our wire revision");
    println!("  schema                         Print the parameter schema document");
    println!("  get <name>...                  Read parameter values");
    println!("  set <name>=<value>...          Write parameter values");
    println!("  watch                          Take the master role and print the data stream");
    println!();
    println!("Values are typed by inference: true/false, integers, floats, `null`,");
    println!("anything else is a string.");
    println!();
    println!("Examples:");
    println!("  fathom-ctl --host 192.168.10.4 version");
    println!("  fathom-ctl get /info/name /control/range");
    println!("  fathom-ctl set /control/enable=true /control/range=150.0");
    println!("  fathom-ctl watch");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = ClientConfig::default();
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    while args.first().map_or(false, |a| a.starts_with("--")) {
        let flag = args.remove(0);
        match flag.as_str() {
            "--host" => {
                if args.is_empty() {
                    bail!("--host needs a value");
                }
                config.host = args.remove(0);
            }
            "--port" => {
                if args.is_empty() {
                    bail!("--port needs a value");
                }
                config.port = args.remove(0).parse().context("--port must be a number")?;
            }
            other => bail!("unknown option '{other}'"),
        }
    }

    let Some(command) = args.first().cloned() else {
        print_usage();
        return Ok(());
    };
    let rest = &args[1..];

    match command.as_str() {
        "version" => {
            // Connecting performs the version exchange; surviving it is the answer.
            let client = SonarClient::connect(&config).await?;
            println!("server at {}:{} speaks our wire revision", config.host, config.port);
            client.shutdown().await;
        }

        "schema" => {
            let client = SonarClient::connect(&config).await?;
            let schema = client.schema();
            println!("# schema id: {}", schema.id);
            print!("{}", schema.data);
            client.shutdown().await;
        }

        "get" => {
            if rest.is_empty() {
                bail!("get needs at least one parameter name");
            }
            let client = SonarClient::connect(&config).await?;
            let names: Vec<&str> = rest.iter().map(String::as_str).collect();
            match client.get(&names).await {
                Some(values) => {
                    for (name, value) in names.iter().zip(values) {
                        println!("{name} = {}", format_value(&value));
                    }
                }
                None => bail!("get failed"),
            }
            client.shutdown().await;
        }

        "set" => {
            if rest.is_empty() {
                bail!("set needs at least one name=value pair");
            }
            let mut params: Vec<(String, ParamValue)> = Vec::new();
            for pair in rest {
                let (name, raw) = pair
                    .split_once('=')
                    .with_context(|| format!("'{pair}' is not name=value"))?;
                params.push((name.to_owned(), parse_value(raw)));
            }

            let client = SonarClient::connect(&config).await?;
            let borrowed: Vec<(&str, ParamValue)> =
                params.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
            if !client.set(&borrowed).await {
                bail!("set failed");
            }
            println!("ok");
            client.shutdown().await;
        }

        "watch" => {
            let client = SonarClient::connect(&config).await?;
            client.subscribe(|msg| {
                println!(
                    "id={} type={} rate={} time={}us size={}",
                    msg.id,
                    msg.type_tag,
                    msg.rate,
                    msg.time,
                    msg.data.len()
                );
            });

            if !client.set_master().await {
                bail!("another client holds the master role");
            }
            println!("master role taken, streaming (ctrl-c to stop)");
            tokio::signal::ctrl_c().await.context("signal wait failed")?;
            client.shutdown().await;
        }

        _ => {
            print_usage();
            bail!("unknown command '{command}'");
        }
    }

    Ok(())
}

/// Infer a typed value from its command-line spelling.
fn parse_value(raw: &str) -> ParamValue {
    match raw {
        "null" => return ParamValue::Null,
        "true" => return ParamValue::Bool(true),
        "false" => return ParamValue::Bool(false),
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return ParamValue::I64(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        return ParamValue::F64(float);
    }
    ParamValue::String(raw.to_owned())
}

fn format_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Null => "null".to_owned(),
        ParamValue::Bool(v) => v.to_string(),
        ParamValue::I64(v) => v.to_string(),
        ParamValue::F64(v) => v.to_string(),
        ParamValue::String(v) => v.clone(),
    }
}
