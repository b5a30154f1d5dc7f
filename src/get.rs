//! Bill lookup commands: `billsync get` and `billsync bills`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::models::NaturalKey;
use crate::store::{BillRepository, SqliteStore, StoredBill};

/// Print one bill by natural key.
pub async fn run_get(config: &Config, key: &NaturalKey) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let found = store.get_by_natural_key(key).await;
    pool.close().await;

    let stored = match found? {
        Some(stored) => stored,
        None => bail!("bill not found: {}", key),
    };
    print_bill(&stored);
    Ok(())
}

/// List bills of a parliament (optionally one session), newest first.
pub async fn run_bills(
    config: &Config,
    parliament: i32,
    session: Option<i32>,
    limit: usize,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let bills = store.list_by_session(parliament, session, limit, 0).await;
    pool.close().await;
    let bills = bills?;

    if bills.is_empty() {
        println!("No bills stored for parliament {}.", parliament);
        return Ok(());
    }

    println!(
        "  {:<8} {:<6} {:<12} {:<22} TITLE",
        "NUMBER", "SESS", "INTRODUCED", "STATUS"
    );
    println!("  {}", "-".repeat(90));
    for stored in &bills {
        let bill = &stored.bill;
        let introduced = bill
            .introduced_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = bill
            .legisinfo_status
            .as_deref()
            .or(bill.law_status.as_deref())
            .unwrap_or("-");
        println!(
            "  {:<8} {:<6} {:<12} {:<22} {}",
            bill.number,
            format!("{}-{}", bill.parliament, bill.session),
            introduced,
            truncate(status, 22),
            truncate(&bill.title_en, 60)
        );
    }
    println!();
    println!("{} bill(s)", bills.len());
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}

fn print_opt(label: &str, value: Option<&str>) {
    if let Some(value) = value {
        println!("{:<18}{}", label, value);
    }
}

fn print_bill(stored: &StoredBill) {
    let bill = &stored.bill;
    println!("--- Bill ---");
    println!("{:<18}{}", "id:", stored.id);
    println!("{:<18}{}", "key:", bill.natural_key());
    println!("{:<18}{}", "document_key:", bill.document_key());
    println!("{:<18}{}", "title_en:", bill.title_en);
    print_opt("title_fr:", bill.title_fr.as_deref());
    print_opt("short_title_en:", bill.short_title_en.as_deref());
    print_opt("short_title_fr:", bill.short_title_fr.as_deref());
    print_opt("law_status:", bill.law_status.as_deref());
    print_opt("status:", bill.legisinfo_status.as_deref());
    if let Some(date) = bill.introduced_date {
        println!("{:<18}{}", "introduced:", date);
    }
    print_opt("sponsor:", bill.sponsor_politician_name.as_deref());
    if let Some(date) = bill.royal_assent_date {
        let chapter = bill.royal_assent_chapter.as_deref().unwrap_or("");
        println!("{:<18}{} {}", "royal_assent:", date, chapter);
    }
    if !bill.subject_tags.is_empty() {
        println!("{:<18}{}", "subjects:", bill.subject_tags.join(", "));
    }
    if !bill.committee_studies.is_empty() {
        println!("{:<18}{}", "committees:", bill.committee_studies.join(", "));
    }
    if !bill.related_bill_numbers.is_empty() {
        println!("{:<18}{}", "related:", bill.related_bill_numbers.join(", "));
    }
    println!(
        "{:<18}openparliament={} legisinfo={}",
        "sources:", bill.source_openparliament, bill.source_legisinfo
    );
    println!("{:<18}{}", "last_fetched_at:", bill.last_fetched_at.to_rfc3339());
    if let Some(at) = bill.last_enriched_at {
        println!("{:<18}{}", "last_enriched_at:", at.to_rfc3339());
    }
    println!("{:<18}{}", "created_at:", stored.created_at.to_rfc3339());
    println!("{:<18}{}", "updated_at:", stored.updated_at.to_rfc3339());

    for (label, summary) in [
        ("Summary (en)", &bill.legisinfo_summary_en),
        ("Summary (fr)", &bill.legisinfo_summary_fr),
    ] {
        if let Some(text) = summary {
            println!();
            println!("--- {} ---", label);
            println!("{}", text);
        }
    }
}
