use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use contact_cache::cache::{
    Address, CachedContact, ContactCache, ResolveListener, View, ViewListener,
};
use contact_cache::config::{self, Config};
use contact_cache::contact::{Contact, ContactId, FetchTypes, OnlineAccount};
use contact_cache::store::{LocalStore, LocalStoreOptions, SqliteJournal, SELF_CONTACT_ID};

#[derive(Parser, Debug)]
#[command(name = "contact-cache", version, about = "Query and edit a cached address book")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Contact database, overriding the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a contact
    Add(AddArgs),
    /// Look a contact up by phone number, email address or online account
    Resolve(ResolveArgs),
    /// List the contacts of a view in display order
    List(ListArgs),
    /// Show non-empty name groups and their sizes
    Groups,
    /// Remove a contact by id
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
struct AddArgs {
    #[arg(long)]
    first: String,

    #[arg(long)]
    last: Option<String>,

    #[arg(long = "phone")]
    phones: Vec<String>,

    #[arg(long = "email")]
    emails: Vec<String>,

    /// Online account as PATH=URI
    #[arg(long = "account", value_parser = parse_account)]
    accounts: Vec<(String, String)>,

    #[arg(long, default_value_t = false)]
    favorite: bool,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("address").required(true).args(["phone", "email", "account"])))]
struct ResolveArgs {
    #[arg(long)]
    phone: Option<String>,

    #[arg(long)]
    email: Option<String>,

    /// Online account as PATH=URI
    #[arg(long, value_parser = parse_account)]
    account: Option<(String, String)>,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long, value_enum, default_value_t = ViewArg::All)]
    view: ViewArg,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    id: ContactId,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ViewArg {
    All,
    Favorites,
    Online,
}

impl From<ViewArg> for View {
    fn from(value: ViewArg) -> Self {
        match value {
            ViewArg::All => View::All,
            ViewArg::Favorites => View::Favorites,
            ViewArg::Online => View::Online,
        }
    }
}

fn parse_account(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((path, uri)) if !path.is_empty() && !uri.is_empty() => {
            Ok((path.to_string(), uri.to_string()))
        }
        _ => Err(format!("expected PATH=URI, got `{value}`")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }

    let store = Arc::new(open_store(&config)?);

    match cli.command {
        Command::Add(args) => handle_add(args, &store),
        Command::Remove(args) => handle_remove(args, &store),
        Command::Resolve(args) => {
            handle_resolve(args, cache(&store, &config), config.cache.phone_match_digits).await
        }
        Command::List(args) => handle_list(args, cache(&store, &config)).await,
        Command::Groups => handle_groups(cache(&store, &config)).await,
    }
}

fn open_store(config: &Config) -> Result<LocalStore<SqliteJournal>> {
    let journal = SqliteJournal::open(&config.database).with_context(|| {
        format!("failed to open contact database at {}", config.database.display())
    })?;
    let options = LocalStoreOptions {
        phone_region: config.phone_region.clone(),
    };
    LocalStore::open(journal, options).context("failed to load contacts")
}

fn cache(store: &Arc<LocalStore<SqliteJournal>>, config: &Config) -> ContactCache {
    ContactCache::new(store.clone(), config.cache.clone())
}

// =============================================================================
// Mutations
// =============================================================================

// Mutations go straight to the store so they are durable before exit.

fn handle_add(args: AddArgs, store: &LocalStore<SqliteJournal>) -> Result<()> {
    let mut contact = Contact::new(args.first, args.last.unwrap_or_default());
    contact.phone_numbers = args.phones;
    contact.email_addresses = args.emails;
    contact.online_accounts = args
        .accounts
        .into_iter()
        .map(|(path, uri)| OnlineAccount::new(path, uri))
        .collect();
    contact.favorite = args.favorite;

    let ids = store.save_now(vec![contact]).context("failed to save contact")?;
    let Some(id) = ids.first() else {
        bail!("store did not report the new contact");
    };
    println!("Added contact {id}");
    Ok(())
}

fn handle_remove(args: RemoveArgs, store: &LocalStore<SqliteJournal>) -> Result<()> {
    if args.id == SELF_CONTACT_ID {
        bail!("the self contact cannot be removed");
    }
    if store.contact(args.id).is_none() {
        bail!("no contact with id {}", args.id);
    }
    store
        .remove_now(&[args.id])
        .with_context(|| format!("failed to remove contact {}", args.id))?;
    println!("Removed contact {}", args.id);
    Ok(())
}

// =============================================================================
// Queries
// =============================================================================

struct Resolved(mpsc::UnboundedSender<Option<CachedContact>>);

impl ResolveListener for Resolved {
    fn address_resolved(&self, _address: &Address, item: Option<&CachedContact>) {
        let _ = self.0.send(item.cloned());
    }
}

async fn handle_resolve(args: ResolveArgs, cache: ContactCache, match_digits: usize) -> Result<()> {
    let address = match (args.phone, args.email, args.account) {
        (Some(phone), _, _) => Address::phone(phone),
        (_, Some(email), _) => Address::email(email),
        (_, _, Some((path, uri))) => Address::account(path, uri),
        _ => bail!("one of --phone, --email or --account is required"),
    };
    let shown = match &address {
        Address::Phone(number) => number.clone(),
        Address::Email(email) => email.clone(),
        Address::Account { path, uri } => format!("{path}={uri}"),
    };
    if address.key(match_digits).is_none() {
        bail!("\"{shown}\" is not a usable address");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = cache.register_resolve_listener(Arc::new(Resolved(tx)));
    let immediate = match &address {
        Address::Phone(number) => cache.resolve_phone_number(listener, number, true),
        Address::Email(email) => cache.resolve_email_address(listener, email, true),
        Address::Account { path, uri } => cache.resolve_online_account(listener, path, uri, true),
    };

    let resolved = match immediate {
        Some(item) => Some(item),
        None => rx.recv().await.flatten(),
    };

    match resolved {
        Some(item) => print_contact(&item),
        None => println!("No match for \"{shown}\""),
    }
    Ok(())
}

/// Tells when a view has finished its initial population.
struct Populated(mpsc::UnboundedSender<View>);

impl ViewListener for Populated {
    fn populated(&self, view: View) {
        let _ = self.0.send(view);
    }
}

async fn populate(cache: &ContactCache, view: View) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    cache.register_view(view, Arc::new(Populated(tx)), FetchTypes::all());
    while !cache.is_populated(view) {
        if rx.recv().await.is_none() {
            bail!("cache stopped before {view:?} was populated");
        }
    }
    Ok(())
}

async fn handle_list(args: ListArgs, cache: ContactCache) -> Result<()> {
    let view = View::from(args.view);
    populate(&cache, view).await?;

    for id in cache.contacts(view) {
        if let Some(item) = cache.existing_item(id) {
            println!("{}\t{}", item.id, item.display_label);
        }
    }
    Ok(())
}

async fn handle_groups(cache: ContactCache) -> Result<()> {
    populate(&cache, View::All).await?;

    let groups = cache.name_groups();
    for group in cache.all_name_groups() {
        if let Some(members) = groups.get(&group) {
            println!("{}\t{}", group, members.len());
        }
    }
    Ok(())
}

fn print_contact(item: &CachedContact) {
    println!("{}\t{}", item.id, item.display_label);
    for number in &item.contact.phone_numbers {
        println!("  phone\t{number}");
    }
    for email in &item.contact.email_addresses {
        println!("  email\t{email}");
    }
    for account in &item.contact.online_accounts {
        println!("  account\t{}={}", account.path, account.uri);
    }
}
