//! Offline repair jobs over the phrase store.

use std::collections::HashMap;

use tracing::info;

use crate::error::Result;
use crate::model::Phrase;
use crate::repository::{PhraseRepository, WriteOp};
use crate::translate::parse::looks_like_question;

/// Collapse phrases sharing the exact same text in `locale`. The survivor is
/// the one with the highest usage, ties going to the oldest. Returns the
/// number of deleted phrases.
pub async fn dedupe_locale(repo: &dyn PhraseRepository, locale: &str) -> Result<usize> {
    // list_locale returns oldest first, so a stable sort on usage keeps age order.
    let phrases = repo.list_locale(locale).await?;
    let mut by_text: HashMap<&str, Vec<&Phrase>> = HashMap::new();
    for p in &phrases {
        by_text.entry(p.text.as_str()).or_default().push(p);
    }

    let mut ops = Vec::new();
    for group in by_text.values_mut().filter(|g| g.len() > 1) {
        group.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        ops.extend(group[1..].iter().map(|p| WriteOp::Delete(p.id.clone())));
    }

    let deleted = ops.len();
    if deleted > 0 {
        repo.batch_write(ops).await?;
    }
    info!(locale, scanned = phrases.len(), deleted, "duplicate cleanup complete");
    Ok(deleted)
}

/// Re-derive `is_question` for every phrase whose stored flag disagrees with
/// the question heuristic, translated or not. Returns the number of updated
/// phrases.
pub async fn backfill_is_question(repo: &dyn PhraseRepository, locales: &[String]) -> Result<usize> {
    let mut updated = 0;
    for locale in locales {
        let ops: Vec<WriteOp> = repo
            .list_locale(locale)
            .await?
            .into_iter()
            .filter_map(|p| {
                let derived = looks_like_question(&p.text);
                (derived != p.is_question).then(|| WriteOp::SetQuestion {
                    id: p.id,
                    is_question: derived,
                })
            })
            .collect();
        let count = ops.len();
        if count > 0 {
            repo.batch_write(ops).await?;
        }
        info!(locale = %locale, updated = count, "is_question backfill");
        updated += count;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocaleTable;
    use crate::model::Embedding;
    use crate::repository::SqlitePhraseStore;

    fn store() -> SqlitePhraseStore {
        SqlitePhraseStore::open_in_memory(&LocaleTable::default()).unwrap()
    }

    fn phrase(text: &str, usage: u64, created_at: i64) -> Phrase {
        let mut p = Phrase::new(text, "en-US-CA", None);
        p.usage_count = usage;
        p.created_at = created_at;
        p
    }

    #[tokio::test]
    async fn keeps_highest_usage_then_oldest() {
        let s = store();
        let busy = phrase("Hello", 9, 300);
        let old = phrase("Thanks", 2, 100);
        s.batch_write(vec![
            WriteOp::Upsert(phrase("Hello", 1, 100)),
            WriteOp::Upsert(busy.clone()),
            WriteOp::Upsert(phrase("Thanks", 2, 200)),
            WriteOp::Upsert(old.clone()),
            WriteOp::Upsert(phrase("Unique", 1, 100)),
        ])
        .await
        .unwrap();

        let deleted = dedupe_locale(&s, "en-US-CA").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(s.count(Some("en-US-CA")).unwrap(), 3);
        assert!(s.get(&busy.id).await.unwrap().is_some());
        assert!(s.get(&old.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backfill_repairs_translated_phrases_too() {
        let s = store();
        let fresh_q = phrase("Where is the beach", 1, 1);
        let plain = phrase("Good morning", 1, 1);
        // A source that has already been translated carries an intent vector.
        let mut translated_q = phrase("Is it raining", 3, 1);
        translated_q.intent_embedding = Some(Embedding::new(vec![1.0]));
        let mut settled = phrase("Are you coming", 1, 1);
        settled.intent_embedding = Some(Embedding::new(vec![1.0]));
        settled.is_question = true;
        s.batch_write(vec![
            WriteOp::Upsert(fresh_q.clone()),
            WriteOp::Upsert(plain.clone()),
            WriteOp::Upsert(translated_q.clone()),
            WriteOp::Upsert(settled.clone()),
        ])
        .await
        .unwrap();

        let n = backfill_is_question(&s, &["en-US-CA".to_string()]).await.unwrap();
        assert_eq!(n, 2);
        assert!(s.get(&fresh_q.id).await.unwrap().unwrap().is_question);
        assert!(!s.get(&plain.id).await.unwrap().unwrap().is_question);
        assert!(s.get(&translated_q.id).await.unwrap().unwrap().is_question);
        assert!(s.get(&settled.id).await.unwrap().unwrap().is_question);

        let again = backfill_is_question(&s, &["en-US-CA".to_string()]).await.unwrap();
        assert_eq!(again, 0);
    }
}
