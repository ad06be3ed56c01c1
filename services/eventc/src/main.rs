// eventc: command-line client for the broker.
//
// Exit codes: 0 success, 1 argument error, 2 connection/send failure.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use eventc::{ClientOptions, SendRequest};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let matches = Command::new("eventc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Basic CLI client for the event broker")
        .after_help(
            "Normal mode: eventc <event category> <event name> [<event UUID>]\n\
             \x20 eventc connects to <URI> and sends an event.\n\
             \x20 Passing '' (empty string) as UUID prints the generated UUID to stdout.\n\
             \n\
             Subscribe mode: eventc --subscribe [<event category>...]\n\
             \x20 eventc connects to <URI> and prints events of the given categories.\n\
             \x20 With no category it prints every event.",
        )
        .arg(
            Arg::new("args")
                .help("Event category and name (or categories in subscribe mode)")
                .num_args(0..),
        )
        .arg(
            Arg::new("data")
                .help("Event data to send")
                .short('d')
                .long("data")
                .value_name("name=content")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("data-string")
                .help("Event data strings to send")
                .short('D')
                .long("data-string")
                .value_name("name=string")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("data-file")
                .help("Event data to send from a file")
                .short('f')
                .long("data-file")
                .value_name("name=[mime-type@]filename")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("uri")
                .help("URI to connect to (defaults to $HERALD_HOST if defined)")
                .short('u')
                .long("uri")
                .value_name("URI"),
        )
        .arg(
            Arg::new("identity")
                .help("Server identity to check for in the TLS certificate")
                .short('i')
                .long("identity")
                .value_name("host"),
        )
        .arg(
            Arg::new("max-tries")
                .help("Maximum connection attempts (0 for infinite)")
                .short('m')
                .long("max-tries")
                .value_parser(clap::value_parser!(u32))
                .default_value("3"),
        )
        .arg(
            Arg::new("subscribe")
                .help("Subscribe mode")
                .short('s')
                .long("subscribe")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ping-interval")
                .help("Ping interval in seconds")
                .short('p')
                .long("ping-interval")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("insecure")
                .help("Accept insecure certificates (unknown CA)")
                .long("insecure")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let options = ClientOptions {
        uri: matches.get_one::<String>("uri").cloned(),
        identity: matches.get_one::<String>("identity").cloned(),
        insecure: matches.get_flag("insecure"),
        ping_interval: matches
            .get_one::<u64>("ping-interval")
            .map(|&secs| Duration::from_secs(secs)),
        max_tries: *matches.get_one::<u32>("max-tries").expect("has a default"),
    };
    let args: Vec<String> = matches
        .get_many::<String>("args")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    if matches.get_flag("subscribe") {
        return match eventc::run_subscribe(&options, &args, |event| {
            println!("{}", eventc::format_event(event));
        })
        .await
        {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("eventc: {}", error);
                ExitCode::from(2)
            }
        };
    }

    let mut args = args.into_iter();
    let (Some(category), Some(name)) = (args.next(), args.next()) else {
        eprintln!("You must define the category and the name of the event.");
        return ExitCode::from(1);
    };
    let uuid = args.next();
    if args.next().is_some() {
        eprintln!("Too many arguments.");
        return ExitCode::from(1);
    }

    type DataParser = fn(&str) -> Result<(String, herald_event::Value), eventc::EventcError>;
    let parsers: [(DataParser, &str); 3] = [
        (eventc::parse_data_arg, "data"),
        (eventc::parse_data_string_arg, "data-string"),
        (eventc::parse_data_file_arg, "data-file"),
    ];
    let mut data = Vec::new();
    for (parse, key) in parsers {
        if let Some(values) = matches.get_many::<String>(key) {
            for value in values {
                match parse(value) {
                    Ok(pair) => data.push(pair),
                    Err(error) => {
                        eprintln!("eventc: {}", error);
                        return ExitCode::from(1);
                    }
                }
            }
        }
    }

    let request = SendRequest {
        category,
        name,
        uuid,
        data,
    };
    match eventc::run_send(&options, &request).await {
        Ok(Some(uuid)) => {
            println!("{}", uuid);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("eventc: {}", error);
            ExitCode::from(2)
        }
    }
}
