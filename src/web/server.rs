use std::path::Path;

use actix_cors::Cors;
use actix_files as fs;
use actix_web::dev::Server;
use actix_web::{http, middleware, web, App, HttpServer};
use log::{info, warn};

use crate::core::config::{ObjectStoreSettings, Settings};
use crate::core::context::ServiceContext;
use crate::web::handlers;

/// Register every route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            // Account APIs
            .route("/auth/register", web::post().to(handlers::auth::register))
            .route("/auth/login", web::post().to(handlers::auth::login))
            .route("/auth/verify-email", web::post().to(handlers::auth::verify_email))
            .route("/auth/resend-verification", web::post().to(handlers::auth::resend_verification))
            .route("/auth/forgot-password", web::post().to(handlers::auth::forgot_password))
            .route("/auth/reset-password", web::post().to(handlers::auth::reset_password))
            .route("/users/me", web::get().to(handlers::auth::read_users_me))
            // Dataset APIs
            .route("/datasets/upload", web::post().to(handlers::datasets::upload_dataset))
            .route("/datasets", web::get().to(handlers::datasets::list_datasets))
            .route("/datasets/atlas", web::get().to(handlers::atlas::list_atlas_datasets))
            .route("/datasets/single_atlas/{dataset_id}", web::get().to(handlers::atlas::get_single_atlas))
            .route("/datasets/umaps_by_tissue/{tissue}", web::get().to(handlers::atlas::get_umaps_by_tissue))
            .route("/datasets/atlas_metadata/{name}", web::get().to(handlers::atlas::get_atlas_metadata))
            .route(r"/datasets/{dataset_id:\d+}", web::get().to(handlers::datasets::get_dataset))
            .route(r"/datasets/{dataset_id:\d+}", web::delete().to(handlers::datasets::delete_dataset))
            // Analysis APIs
            .route("/analysis/start/{dataset_id}", web::post().to(handlers::analysis::start_analysis))
            .route("/analysis/status/{task_id}", web::get().to(handlers::analysis::get_analysis_status))
            // Atlas method APIs
            .route("/atlas/function-download", web::post().to(handlers::atlas::start_function_download))
            .route(
                "/atlas/function-download/status/{task_id}",
                web::get().to(handlers::atlas::get_function_download_status),
            )
            // System APIs
            .route("/system/status", web::get().to(handlers::system::get_system_status)),
    )
    .route("/user_uploads/{tail:.*}", web::get().to(handlers::datasets::download_upload))
    .route("/metrics", web::get().to(handlers::system::get_metrics))
    .route("/mcp", web::post().to(handlers::mcp::mcp_endpoint));
}

fn cors(settings: &Settings) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allowed_headers(vec![http::header::AUTHORIZATION, http::header::ACCEPT, http::header::CONTENT_TYPE])
        .supports_credentials()
        .max_age(3600);
    for origin in settings.cors_origins() {
        cors = cors.allowed_origin(origin);
    }
    cors
}

/// Static directories served next to the API, as (mount, directory).
/// Uploads are not among them; `download_upload` checks dataset access.
fn static_mounts(settings: &Settings) -> Vec<(String, std::path::PathBuf)> {
    let mut mounts = Vec::new();
    if let ObjectStoreSettings::Local { root } = &settings.object_store {
        mounts.push(("/objects".to_string(), root.clone()));
    }
    for name in ["umaps", "atlas_pattern", "atlas_pattern_csv"] {
        let dir = settings.static_root.join(name);
        if dir.is_dir() {
            mounts.push((format!("/{}", name), dir));
        } else {
            warn!("Not serving /{}: {} does not exist", name, dir.display());
        }
    }
    mounts
}

/// Bind the HTTP server; the caller drives it and uses its handle to stop it
pub fn start_web_server(ctx: ServiceContext) -> std::io::Result<Server> {
    let settings = ctx.settings.clone();
    ensure_dir(&settings.upload_dir)?;
    if let ObjectStoreSettings::Local { root } = &settings.object_store {
        ensure_dir(root)?;
    }
    let mounts = static_mounts(&settings);
    let bind_addr = settings.bind_addr.clone();
    info!("Starting web server on http://{}", bind_addr);

    let app_state = web::Data::new(ctx);
    let server = HttpServer::new(move || {
        let mut app = App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors(&settings))
            .app_data(app_state.clone())
            .configure(configure);
        for (mount, dir) in &mounts {
            app = app.service(fs::Files::new(mount, dir));
        }
        app
    })
    .bind(&bind_addr)?
    .shutdown_timeout(30)
    .run();
    Ok(server)
}

fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
