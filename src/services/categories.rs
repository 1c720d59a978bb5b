use std::sync::Arc;

use tracing::info;

use crate::ai::MetadataDeriver;
use crate::db::{CategoryInsert, Repository};
use crate::error::{AppError, Result};
use crate::models::{
    validate_name, Category, DerivedMetadata, NewCategory, MAX_ACTIVE_CATEGORIES,
};

/// Category CRUD as the ingestion pipeline sees it.
pub struct CategoryService {
    repo: Repository,
    deriver: Option<Arc<MetadataDeriver>>,
}

impl CategoryService {
    pub fn new(repo: Repository, deriver: Option<Arc<MetadataDeriver>>) -> Self {
        Self { repo, deriver }
    }

    /// Validates the name, derives metadata once, and inserts under the
    /// per-owner cap.
    pub async fn create(&self, owner_id: i64, name: &str) -> Result<Category> {
        let name = validate_name(name)?;

        let metadata = match &self.deriver {
            Some(deriver) => deriver.derive(&name).await,
            None => DerivedMetadata::fallback(&name),
        };

        let outcome = self
            .repo
            .insert_category(NewCategory {
                owner_id,
                name: name.clone(),
                metadata,
            })
            .await?;

        let id = match outcome {
            CategoryInsert::Inserted(id) => id,
            CategoryInsert::LimitReached => {
                return Err(AppError::Validation(format!(
                    "owner {} already has {} active categories",
                    owner_id, MAX_ACTIVE_CATEGORIES
                )))
            }
            CategoryInsert::Duplicate => {
                return Err(AppError::Validation(format!(
                    "owner {} already has a category named '{}'",
                    owner_id, name
                )))
            }
        };
        info!(owner_id, category_id = id, name = %name, "Category created");

        self.repo
            .get_category(id)
            .await?
            .ok_or_else(|| AppError::from(anyhow::anyhow!("category {} vanished after insert", id)))
    }

    pub async fn deactivate(&self, id: i64) -> Result<()> {
        if !self.repo.deactivate_category(id).await? {
            return Err(AppError::NotFound(format!("category {}", id)));
        }
        info!(category_id = id, "Category deactivated");
        Ok(())
    }

    pub async fn list(&self, owner_id: i64, active_only: bool) -> Result<Vec<Category>> {
        self.repo.categories_for_owner(owner_id, active_only).await
    }

    /// By id when `reference` is numeric, otherwise by name, then by derived
    /// summary.
    pub async fn resolve(&self, owner_id: i64, reference: &str) -> Result<Category> {
        if let Ok(id) = reference.trim().parse::<i64>() {
            if let Some(category) = self.repo.get_category(id).await? {
                if category.owner_id == owner_id {
                    return Ok(category);
                }
            }
        }
        self.repo
            .resolve_category(owner_id, reference)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no category '{}' for owner {}",
                    reference.trim(),
                    owner_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::{completion, ScriptedChat};
    use crate::error::ErrorKind;

    async fn service(responses: Vec<Result<String>>) -> (CategoryService, Arc<ScriptedChat>) {
        let repo = Repository::open_in_memory().await.unwrap();
        let chat = Arc::new(ScriptedChat::with(responses));
        let deriver = Arc::new(MetadataDeriver::new(chat.clone(), "sonar"));
        (CategoryService::new(repo, Some(deriver)), chat)
    }

    #[tokio::test]
    async fn create_derives_metadata_once() {
        let content = r#"{"summary": "Rust news", "subreddits": ["rust"], "handles": []}"#;
        let (service, chat) = service(vec![Ok(completion(content))]).await;

        let category = service.create(1, "  Rust language  ").await.unwrap();
        assert_eq!(category.name, "Rust language");
        assert_eq!(category.derived_summary.as_deref(), Some("Rust news"));
        assert_eq!(category.derived_subreddits, vec!["rust"]);
        assert!(category.active);
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn create_rejects_invalid_names_without_calling_out() {
        let (service, chat) = service(Vec::new()).await;
        let err = service.create(1, "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(service.create(1, &"x".repeat(141)).await.is_err());
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn sixth_active_category_is_rejected() {
        let repo = Repository::open_in_memory().await.unwrap();
        let service = CategoryService::new(repo, None);
        for i in 0..5 {
            service.create(1, &format!("topic {}", i)).await.unwrap();
        }
        let err = service.create(1, "one too many").await.unwrap_err();
        assert!(err.to_string().contains("5 active categories"));

        // a deactivated category frees a slot
        let first = service.resolve(1, "topic 0").await.unwrap();
        service.deactivate(first.id).await.unwrap();
        service.create(1, "one too many").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let repo = Repository::open_in_memory().await.unwrap();
        let service = CategoryService::new(repo, None);
        service.create(1, "Rust").await.unwrap();
        let err = service.create(1, "Rust").await.unwrap_err();
        assert!(err.to_string().contains("already has a category named"));
        service.create(2, "Rust").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_name_can_be_added_again() {
        let repo = Repository::open_in_memory().await.unwrap();
        let service = CategoryService::new(repo, None);
        let first = service.create(1, "Rust").await.unwrap();
        service.deactivate(first.id).await.unwrap();

        let second = service.create(1, "Rust").await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(service.resolve(1, "Rust").await.unwrap().id, second.id);
        assert!(service.create(1, "Rust").await.is_err());
        assert_eq!(service.list(1, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolve_by_id_name_or_summary() {
        let repo = Repository::open_in_memory().await.unwrap();
        let service = CategoryService::new(repo, None);
        let created = service
            .create(1, "Artificial intelligence policy in Europe")
            .await
            .unwrap();

        let by_id = service.resolve(1, &created.id.to_string()).await.unwrap();
        let by_summary = service
            .resolve(1, "Artificial intelligence policy in")
            .await
            .unwrap();
        assert_eq!(by_id.id, created.id);
        assert_eq!(by_summary.id, created.id);

        let err = service.resolve(2, &created.id.to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn deactivating_unknown_category_is_not_found() {
        let repo = Repository::open_in_memory().await.unwrap();
        let service = CategoryService::new(repo, None);
        assert!(matches!(
            service.deactivate(42).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }
}
