// src/main.rs

use dotenvy::dotenv;
use examguard::config::Config;
use examguard::routes;
use examguard::state::AppState;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Initialize Database Pool
    let connect_options = SqliteConnectOptions::from_str(&config.database_url)
        .expect("Invalid DATABASE_URL")
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    // Seed a demo quiz so a fresh install has something to serve
    if let Err(e) = seed_demo_quiz(&pool).await {
        tracing::error!("Failed to seed demo quiz: {:?}", e);
    }

    // Create AppState
    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
    };

    // Create the Axum application router
    let app = routes::create_router(state);

    tracing::info!("Time authority listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap();

    // Start the server
    axum::serve(listener, app).await.unwrap();
}

async fn seed_demo_quiz(pool: &SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
    let quiz_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM quizzes")
        .fetch_one(pool)
        .await?;

    if quiz_count > 0 {
        return Ok(());
    }

    tracing::info!("Seeding demo quiz...");

    let quiz_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO quizzes (title, duration_seconds) VALUES (?, ?) RETURNING id",
    )
    .bind("Demo Quiz")
    .bind(900)
    .fetch_one(pool)
    .await?;

    let questions = [
        ("Which layer owns the canonical exam timer?", "general"),
        ("What happens when a student hides the exam tab?", "integrity"),
        ("Which value drives the frozen countdown display?", "integrity"),
    ];

    for (content, subcategory) in questions {
        sqlx::query(
            "INSERT INTO questions (quiz_id, content, options, subcategory) VALUES (?, ?, ?, ?)",
        )
        .bind(quiz_id)
        .bind(content)
        .bind(serde_json::json!(["A", "B", "C", "D"]).to_string())
        .bind(subcategory)
        .execute(pool)
        .await?;
    }

    tracing::info!("Demo quiz seeded successfully.");
    Ok(())
}
