use stackview::app::StackViewApp;
use stackview::config::ViewerConfig;
use stackview::launch;
use tracing_subscriber::EnvFilter;

fn main() -> eframe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => (None, Some(format!("Launch URL/args error: {err}"))),
    };
    let config = ViewerConfig::from_env().clone();

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 820.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "StackView",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(StackViewApp::new(
                config.clone(),
                initial_request.clone(),
                initial_status.clone(),
            )))
        }),
    )
}
