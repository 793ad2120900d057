extern crate clap;
extern crate crossbeam_channel;
extern crate error_chain;
extern crate log;
extern crate log4rs;
extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate tar;
extern crate tungstenite;

extern crate judge;
extern crate sandbox;

mod config;
mod docker;
mod transfer;

use std::sync::Arc;

use clap::{App, Arg, ArgMatches};

use judge::{judge_submission, JudgeEnv};
use sandbox::ContainerRuntime;

use config::Settings;
use docker::DockerClient;
use transfer::Transfer;

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Settings(config::Error, config::ErrorKind);
        Docker(docker::Error, docker::ErrorKind);
        Transfer(transfer::Error, transfer::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
    }
}

fn get_arg_matches<'a>() -> ArgMatches<'a> {
    App::new("pjudge")
        .version("0.1.0")
        .about("Remote judge worker: compiles and runs submissions in \
                containers and streams verdicts back to the dispatcher.")
        .arg(Arg::with_name("wdir")
            .long("wdir")
            .takes_value(true)
            .value_name("PATH")
            .default_value("/tmp/pj")
            .help("directory to execute submissions under"))
        .arg(Arg::with_name("server")
            .long("server")
            .takes_value(true)
            .value_name("URL")
            .default_value("ws://127.0.0.1:8080/")
            .help("dispatcher endpoint"))
        .arg(Arg::with_name("settings")
            .long("settings")
            .takes_value(true)
            .value_name("PATH")
            .default_value("./pj.json")
            .help("path to the settings file"))
        .arg(Arg::with_name("genlang")
            .long("genlang")
            .help("print a JSON skeleton of a language catalog entry and exit"))
        .get_matches()
}

/// Initialize log facilities with a console appender.
fn init_log() -> Result<()> {
    let stdout = log4rs::append::console::ConsoleAppender::builder()
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}")))
        .build();
    let config = log4rs::config::Config::builder()
        .appender(log4rs::config::Appender::builder()
            .build("stdout", Box::new(stdout)))
        .build(log4rs::config::Root::builder()
            .appender("stdout")
            .build(log::LevelFilter::Info))
        .map_err(|e| Error::from(format!("invalid logging configuration: {}", e)))
        ?;
    log4rs::init_config(config)
        .map_err(|e| Error::from(format!("failed to initialize logging: {}", e)))
        ?;
    Ok(())
}

/// Initialize every component from the command line and the settings file,
/// then serve the dispatcher until the inbound queue closes.
fn serve(matches: &ArgMatches) -> Result<()> {
    let wdir = matches.value_of("wdir").expect("--wdir has a default value");
    std::fs::create_dir_all(wdir)
        .chain_err(|| format!("cannot create the working directory {}", wdir))
        ?;

    let settings_path = matches.value_of("settings")
        .expect("--settings has a default value");
    let settings = match Settings::from_file(settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            // Bootstrap a missing settings file with a template so the
            // operator has something to edit.
            if !std::path::Path::new(settings_path).exists() {
                match std::fs::write(settings_path, config::SETTINGS_TEMPLATE) {
                    Ok(..) => log::error!(
                        "created a settings template at {}", settings_path),
                    Err(we) => log::error!(
                        "cannot create a settings template at {}: {}",
                        settings_path, we)
                }
            }
            return Err(e.into());
        }
    };
    log::info!("worker \"{}\" starting, parallelism {}, cpu usage {}%",
        settings.name, settings.parallelism, settings.cpu_usage);

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerClient::new(&settings.docker_host)?);
    let catalog = Arc::new(settings.catalog());
    log::info!("language catalog holds {} entries", catalog.len());

    let server = matches.value_of("server").expect("--server has a default value");
    let transfer = Transfer::connect(server, &settings.auth, settings.parallelism)?;
    let (requests, responses) = transfer.start();

    let mut env = JudgeEnv::new(runtime, wdir);
    env.cpu_usage = settings.cpu_usage;
    let env = Arc::new(env);

    // One coordinator thread per request. The dispatcher observes the
    // advertised parallelism and keeps the number of submissions in flight
    // within it.
    for request in requests.iter() {
        log::info!("submission {} received", request.sid);
        let env = env.clone();
        let catalog = catalog.clone();
        let responses = responses.clone();
        std::thread::spawn(move || {
            judge_submission(env, &catalog, request, &responses);
        });
    }

    log::info!("dispatcher channel closed, shutting down");
    Ok(())
}

fn run() -> i32 {
    let matches = get_arg_matches();

    if matches.is_present("genlang") {
        println!("{}", config::LANGUAGE_TEMPLATE);
        return 0;
    }

    if let Err(e) = init_log() {
        eprintln!("{}", e);
        return 1;
    }

    match serve(&matches) {
        Ok(..) => 0,
        Err(e) => {
            log::error!("{}", e);
            for cause in e.iter().skip(1) {
                log::error!("caused by: {}", cause);
            }
            1
        }
    }
}

fn main() {
    std::process::exit(run());
}
