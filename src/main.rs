mod app_runtime;
mod classifier_adapter;
mod color_analyzer;
mod config;
mod enrichment_pipeline;
mod http_transport;
mod image_pipeline;
mod knowledge_client;
mod presentation;
mod protocol;

use std::path::PathBuf;

use app_runtime::{AppRuntime, IdentifyRequest};
use classifier_adapter::PresetLabelModel;
use log::info;
use presentation::PresentationState;

const USAGE: &str = "usage: whatflower IMAGE [LABEL[=CONFIDENCE]...]";

fn parse_args(args: &[String]) -> Result<IdentifyRequest, String> {
    let Some((image_path, labels)) = args.split_first() else {
        return Err(USAGE.to_string());
    };
    if image_path == "-h" || image_path == "--help" {
        return Err(USAGE.to_string());
    }
    let model = PresetLabelModel::parse_spec(&labels.join(","))?;
    Ok(IdentifyRequest {
        image_path: PathBuf::from(image_path),
        model: Box::new(model),
    })
}

fn print_presentation(state: &PresentationState) {
    let marker = |is_error: bool| if is_error { " (error)" } else { "" };
    match &state.title {
        Some(title) => println!("Title:   {}{}", title, marker(state.title_is_error)),
        None => println!("Title:   -"),
    }
    match &state.summary {
        Some(summary) => println!("Summary: {}{}", summary, marker(state.summary_is_error)),
        None => println!("Summary: -"),
    }
    if let Some(theme) = &state.theme {
        println!(
            "Theme:   background {} foreground {} light {}",
            theme.background.to_hex(),
            theme.foreground.to_hex(),
            theme.background_light.to_hex()
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_file = config::config_file_path()?;
    let config = config::load_or_create_config(&config_file)?;
    log::set_max_level(config.logging.level_filter());
    info!("Using config {}", config_file.display());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = parse_args(&args)?;
    let state = AppRuntime::build(config)?.run(request)?;
    print_presentation(&state);
    Ok(())
}
