use anyhow::Context;
use castline_persistence::SqliteCastStore;
use castline_ratelimit::normalize_phone;
use castline_server::registration::generate_registration_code;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum CastActions {
    /// Create a cast and print its registration code
    Add {
        #[arg(short, long)]
        store: i64,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        phone: Option<String>,
    },
    /// List casts
    List {
        #[arg(short, long)]
        store: Option<i64>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
}

pub async fn run(action: CastActions, store: &SqliteCastStore) -> anyhow::Result<()> {
    match action {
        CastActions::Add { store: store_id, name, phone } => {
            let phone = canonical_phone(phone.as_deref())?;
            let code = generate_registration_code();
            let cast = store
                .create_cast(store_id, &name, phone.as_deref(), Some(&code))
                .await?;
            println!("Created cast #{} ({})", cast.id, cast.name);
            println!("Registration code: {}", code);
            println!("Ask the cast to send this code to the LINE account.");
        }
        CastActions::List { store: store_id, limit } => {
            let casts = store.list_casts(store_id, limit).await?;
            if casts.is_empty() {
                println!("No casts.");
                return Ok(());
            }
            for cast in casts {
                let line = if cast.line_user_id.is_some() { "linked" } else { "-" };
                let phone = match (&cast.phone, cast.phone_verified_at) {
                    (Some(p), Some(_)) => format!("{} (verified)", p),
                    (Some(p), None) => p.clone(),
                    (None, _) => "-".to_string(),
                };
                println!(
                    "#{:<5} store={:<4} {:<20} line={:<7} phone={}",
                    cast.id, cast.store_id, cast.name, line, phone
                );
            }
        }
    }
    Ok(())
}

/// Phones are stored in the same form the verification endpoints key on.
fn canonical_phone(raw: Option<&str>) -> anyhow::Result<Option<String>> {
    raw.map(|p| normalize_phone(p).with_context(|| format!("Invalid phone number: {}", p)))
        .transpose()
}
