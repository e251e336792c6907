use anyhow::Context;
use colored::Colorize;

use strata_core::{
    BackendKind, CacheRepository, CachedObject, CachedType, EventKind, EventStream, Manager,
    StoreConfig, StoreEvent,
};
use strata_types::{AttributeKey, ObjectKey, Slice};

use crate::cli::*;

const VALUE: AttributeKey = AttributeKey::new(1);
const NAME: AttributeKey = AttributeKey::new(1);
const AGE: AttributeKey = AttributeKey::new(2);
const PEOPLE: &str = "person";
const NAMES: [&str; 5] = ["Ada", "Grace", "Edsger", "Barbara", "Ken"];

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    let mut manager = Manager::open(&config).context("opening store")?;
    let mut events = manager.subscribe_filtered(&[EventKind::SliceChanged]);
    match cli.command {
        Command::Slices => cmd_slices(&mut manager, &mut events),
        Command::Cache(args) => cmd_cache(&mut manager, &mut events, args),
        Command::Info => cmd_info(&manager),
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.backend = BackendKind::Sqlite;
        config.path = Some(db.clone());
    }
    if cli.reset {
        config.reset_on_open = true;
    }
    Ok(config)
}

fn cmd_slices(manager: &mut Manager, events: &mut EventStream) -> anyhow::Result<()> {
    let root = manager.add_slice(None)?;
    manager.set_current_slice(root)?;
    report_slice_changes(events);

    let key = manager.create_object(None, "demo")?.key;
    println!("{} object {}", "Created".green().bold(), key.to_string().bold());
    write_value(manager, key, "foo")?;

    let child = manager.next_slice()?;
    report_slice_changes(events);
    write_value(manager, key, "baz")?;
    read_value(manager, key, child)?;

    manager.set_current_slice(root)?;
    report_slice_changes(events);
    read_value(manager, key, root)?;

    println!(
        "{} {} writes stored for attribute {}",
        "✓".green().bold(),
        manager.write_count(key, VALUE)?,
        VALUE
    );
    Ok(())
}

fn write_value(manager: &mut Manager, key: ObjectKey, value: &str) -> anyhow::Result<()> {
    manager.set_value(key, VALUE, value)?;
    println!("  {} {} = {}", "set".green(), VALUE, value.yellow());
    Ok(())
}

fn read_value(manager: &Manager, key: ObjectKey, slice: Slice) -> anyhow::Result<()> {
    let value: String = manager.get_value(key, VALUE)?;
    println!(
        "  {} {} in slice {} = {}",
        "get".blue(),
        VALUE,
        slice.id.to_string().bold(),
        value.yellow()
    );
    Ok(())
}

/// Element type of the demo repository.
struct Person(CachedObject);

impl Person {
    fn name(&self) -> String {
        self.0.get_property(NAME).unwrap_or_else(|_| "?".into())
    }

    fn age(&self) -> u32 {
        self.0.get_property(AGE).unwrap_or_default()
    }
}

impl CachedType for Person {
    fn from_cached(object: CachedObject) -> Self {
        Person(object)
    }

    fn cached(&self) -> &CachedObject {
        &self.0
    }

    fn cached_mut(&mut self) -> &mut CachedObject {
        &mut self.0
    }
}

fn cmd_cache(manager: &mut Manager, events: &mut EventStream, args: CacheArgs) -> anyhow::Result<()> {
    let root = manager.next_slice()?;
    report_slice_changes(events);
    manager.create_repo::<Person>(PEOPLE)?;

    manager.with_repo::<Person, _>(PEOPLE, |repo, m| {
        for i in 0..args.people {
            let person = repo.create_object(m)?;
            person.0.set_property(m, NAME, NAMES[i as usize % NAMES.len()])?;
            person.0.set_property(m, AGE, 30 + i)?;
        }
        Ok(())
    })?;
    println!("{} {} pending", "Cache:".bold(), yes_no(manager.has_changes()));
    manager.commit()?;
    show_people(manager, root)?;

    let child = manager.next_slice()?;
    report_slice_changes(events);
    manager.with_repo::<Person, _>(PEOPLE, |repo, m| {
        for person in repo.iter_mut() {
            let age = person.age();
            person.0.set_property(m, AGE, age + 1)?;
        }
        Ok(())
    })?;
    manager.commit()?;
    show_people(manager, child)?;

    manager.set_current_slice(root)?;
    report_slice_changes(events);
    manager.with_repo::<Person, _>(PEOPLE, |repo, m| repo.refresh(m))?;
    show_people(manager, root)?;
    println!("{} {} pending", "Cache:".bold(), yes_no(manager.has_changes()));
    Ok(())
}

fn show_people(manager: &Manager, slice: Slice) -> anyhow::Result<()> {
    let repo: &CacheRepository<Person> = manager.get_repo(PEOPLE)?;
    println!("{} {} ({} people)", "Slice".bold(), slice.id.to_string().bold(), repo.len());
    for person in repo.iter() {
        println!(
            "  {:>4}  {:<10} {}",
            person.0.key().to_string().dimmed(),
            person.name(),
            person.age().to_string().yellow()
        );
    }
    Ok(())
}

fn cmd_info(manager: &Manager) -> anyhow::Result<()> {
    let slices = manager.slices()?;
    if slices.is_empty() {
        println!("No slices.");
        return Ok(());
    }
    println!("{} slices", slices.len().to_string().bold());
    for slice in &slices {
        let lineage = manager
            .lineage(slice)?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        let parent = slice
            .parent
            .map_or_else(|| "root".to_string(), |p| p.to_string());
        println!(
            "  {:>4}  parent {:<6} lineage {}",
            slice.id.to_string().yellow(),
            parent,
            lineage.dimmed()
        );
    }
    Ok(())
}

fn report_slice_changes(events: &mut EventStream) {
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::SliceChanged { previous, current } = event {
            let from = previous.map_or_else(|| "none".to_string(), |s| s.id.to_string());
            println!(
                "{} slice {} -> {}",
                "Switched".cyan().bold(),
                from.dimmed(),
                current.id.to_string().bold()
            );
        }
    }
}

fn yes_no(flag: bool) -> colored::ColoredString {
    if flag {
        "changes".yellow()
    } else {
        "no changes".green()
    }
}
