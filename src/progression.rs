//! Module lock state, progress and completion propagation for one student in
//! one class.
//!
//! The computation is split in two: [`compute_class_progress`] is a pure
//! function over an already-loaded [`ClassSnapshot`], and the async functions
//! at the bottom load snapshots from the store and record completions.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument, warn};

use crate::db::{
    find_enrollment, find_item_completion, find_module_completion, find_module_item,
    get_class_assessments, get_class_module_items, get_class_modules,
    get_item_completion_ids_for_class, get_item_completion_ids_for_module, get_module,
    get_module_completion_ids_for_class, get_module_items, insert_item_completion,
    insert_module_completion,
};
use crate::error::AppError;
use crate::models::{Assessment, ItemType, Module, ModuleItem, ModuleItemCompletion};

/// Everything the engine needs to know about one (student, class) pair.
#[derive(Debug, Clone, Default)]
pub struct ClassSnapshot {
    pub modules: Vec<Module>,
    pub items: Vec<ModuleItem>,
    pub assessments: HashMap<i64, Assessment>,
    pub completed_items: HashSet<i64>,
    pub completed_modules: HashSet<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemProgress {
    pub id: i64,
    pub title: String,
    pub item_type: ItemType,
    pub order_index: i64,
    pub is_required: bool,
    pub is_completed: bool,
    pub assessment_id: Option<i64>,
    pub url: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleProgress {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub order_index: i64,
    pub unlock_at: Option<DateTime<Utc>>,
    pub prerequisite_ids: Vec<i64>,
    pub is_time_locked: bool,
    pub is_prerequisite_locked: bool,
    pub is_locked: bool,
    pub is_completed: bool,
    pub progress: f64,
    pub completed_items: usize,
    pub total_items: usize,
    pub items: Vec<ItemProgress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub completion: ModuleItemCompletion,
    pub module_completed: bool,
}

/// An item counts toward progress only if it is published and, for
/// assessment items, its assessment exists and is published.
pub fn is_item_visible(item: &ModuleItem, assessments: &HashMap<i64, Assessment>) -> bool {
    if !item.is_published {
        return false;
    }

    match item.item_type {
        ItemType::Assessment => item
            .assessment_id
            .and_then(|id| assessments.get(&id))
            .is_some_and(|assessment| assessment.is_published),
        ItemType::ExternalLink | ItemType::Page => true,
    }
}

pub fn is_time_locked(module: &Module, now: DateTime<Utc>) -> bool {
    module.unlock_at.is_some_and(|unlock_at| unlock_at > now)
}

/// Only direct prerequisites are consulted, so cycles in the data cannot
/// cause non-termination. Ids outside `class_module_ids` are ignored.
pub fn is_prerequisite_locked(
    module: &Module,
    class_module_ids: &HashSet<i64>,
    completed_modules: &HashSet<i64>,
) -> bool {
    module
        .prerequisite_ids
        .iter()
        .filter(|id| class_module_ids.contains(id))
        .any(|id| !completed_modules.contains(id))
}

pub fn progress_percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

/// Whether every required, visible item of a module is complete. Vacuously
/// true for a module without required items.
pub fn required_items_complete(
    items: &[ModuleItem],
    assessments: &HashMap<i64, Assessment>,
    completed_items: &HashSet<i64>,
) -> bool {
    items
        .iter()
        .filter(|item| item.is_required && is_item_visible(item, assessments))
        .all(|item| completed_items.contains(&item.id))
}

pub fn compute_class_progress(snapshot: &ClassSnapshot, now: DateTime<Utc>) -> Vec<ModuleProgress> {
    let mut modules: Vec<&Module> = snapshot.modules.iter().filter(|m| m.is_published).collect();
    modules.sort_by_key(|m| (m.order_index, m.id));

    let class_module_ids: HashSet<i64> = modules.iter().map(|m| m.id).collect();

    let mut items_by_module: HashMap<i64, Vec<&ModuleItem>> = HashMap::new();
    for item in &snapshot.items {
        if is_item_visible(item, &snapshot.assessments) {
            items_by_module.entry(item.module_id).or_default().push(item);
        }
    }

    modules
        .into_iter()
        .map(|module| {
            let mut visible = items_by_module.remove(&module.id).unwrap_or_default();
            visible.sort_by_key(|item| (item.order_index, item.id));

            let items: Vec<ItemProgress> = visible
                .into_iter()
                .map(|item| ItemProgress {
                    id: item.id,
                    title: item.title.clone(),
                    item_type: item.item_type,
                    order_index: item.order_index,
                    is_required: item.is_required,
                    is_completed: snapshot.completed_items.contains(&item.id),
                    assessment_id: item.assessment_id,
                    url: item.url.clone(),
                    content: item.content.clone(),
                })
                .collect();

            let total_items = items.len();
            let completed_items = items.iter().filter(|item| item.is_completed).count();

            let time_locked = is_time_locked(module, now);
            let prerequisite_locked =
                is_prerequisite_locked(module, &class_module_ids, &snapshot.completed_modules);

            ModuleProgress {
                id: module.id,
                title: module.title.clone(),
                description: module.description.clone(),
                order_index: module.order_index,
                unlock_at: module.unlock_at,
                prerequisite_ids: module.prerequisite_ids.clone(),
                is_time_locked: time_locked,
                is_prerequisite_locked: prerequisite_locked,
                is_locked: time_locked || prerequisite_locked,
                is_completed: snapshot.completed_modules.contains(&module.id),
                progress: progress_percent(completed_items, total_items),
                completed_items,
                total_items,
                items,
            }
        })
        .collect()
}

fn assessments_by_id(assessments: Vec<Assessment>) -> HashMap<i64, Assessment> {
    assessments.into_iter().map(|a| (a.id, a)).collect()
}

async fn require_active_enrollment(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_id: i64,
) -> Result<(), AppError> {
    match find_enrollment(pool, class_id, student_id).await? {
        Some(enrollment) if enrollment.is_active() => Ok(()),
        _ => Err(AppError::Authorization(format!(
            "Student {} has no active enrollment in class {}",
            student_id, class_id
        ))),
    }
}

#[instrument(skip(pool))]
pub async fn load_class_snapshot(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_id: i64,
) -> Result<ClassSnapshot, AppError> {
    Ok(ClassSnapshot {
        modules: get_class_modules(pool, class_id).await?,
        items: get_class_module_items(pool, class_id).await?,
        assessments: assessments_by_id(get_class_assessments(pool, class_id).await?),
        completed_items: get_item_completion_ids_for_class(pool, student_id, class_id).await?,
        completed_modules: get_module_completion_ids_for_class(pool, student_id, class_id).await?,
    })
}

/// Module view of a class for a student. Requires an active enrollment.
#[instrument(skip(pool))]
pub async fn student_class_modules(
    pool: &Pool<Sqlite>,
    student_id: i64,
    class_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<ModuleProgress>, AppError> {
    require_active_enrollment(pool, student_id, class_id).await?;

    let snapshot = load_class_snapshot(pool, student_id, class_id).await?;
    Ok(compute_class_progress(&snapshot, now))
}

/// Records that a student finished an item and, when that was the last
/// required item of its module, that the module is finished too.
///
/// Lock state is not checked here. Completion rows are never rolled back: if
/// the module completion insert fails, the item completion stays.
#[instrument(skip(pool))]
pub async fn complete_item(
    pool: &Pool<Sqlite>,
    student_id: i64,
    item_id: i64,
) -> Result<CompletionOutcome, AppError> {
    let item = match find_module_item(pool, item_id).await? {
        Some(item) if item.is_published => item,
        _ => {
            return Err(AppError::NotFound(format!(
                "Module item {} not found",
                item_id
            )));
        }
    };

    let module = get_module(pool, item.module_id).await?;
    require_active_enrollment(pool, student_id, module.class_id).await?;

    if let Some(existing) = find_item_completion(pool, student_id, item_id).await? {
        info!("Item already completed");
        return Ok(CompletionOutcome {
            completion: existing,
            module_completed: false,
        });
    }

    let completion = match insert_item_completion(pool, student_id, item_id).await? {
        Some(completion) => completion,
        None => {
            // Lost a race with an identical request; behave like the short-circuit.
            let existing = find_item_completion(pool, student_id, item_id)
                .await?
                .ok_or_else(|| {
                    AppError::Internal("Item completion missing after conflict".to_string())
                })?;
            return Ok(CompletionOutcome {
                completion: existing,
                module_completed: false,
            });
        }
    };

    let module_items = get_module_items(pool, module.id).await?;
    let assessments = assessments_by_id(get_class_assessments(pool, module.class_id).await?);
    let completed = get_item_completion_ids_for_module(pool, student_id, module.id).await?;

    let all_required_done = required_items_complete(&module_items, &assessments, &completed);
    let module_completed = if all_required_done
        && find_module_completion(pool, student_id, module.id).await?.is_none()
    {
        insert_module_completion(pool, student_id, module.id)
            .await
            .inspect_err(|e| {
                warn!(error = %e, module_id = module.id, "Item completed but module completion failed");
            })?
    } else {
        false
    };

    info!(module_completed, "Item completion recorded");

    Ok(CompletionOutcome {
        completion,
        module_completed,
    })
}
