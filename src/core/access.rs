use crate::core::error::{ServiceError, ServiceResult};
use crate::db::models::{Dataset, User};

/// Who is acting on a dataset
#[derive(Debug, Clone)]
pub enum Principal {
    User(User),
    /// Anonymous tool-calling clients and seeding commands
    System,
}

impl Principal {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Principal::User(user) => Some(user.id),
            Principal::System => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Principal::User(user) => format!("user {}", user.username),
            Principal::System => "system".to_string(),
        }
    }
}

fn is_owner(dataset: &Dataset, user: &User) -> bool {
    dataset.owner_id == Some(user.id)
}

/// Owner or public
pub fn can_analyze(dataset: &Dataset, caller: &Principal) -> bool {
    if dataset.is_public {
        return true;
    }
    match caller {
        Principal::User(user) => is_owner(dataset, user),
        Principal::System => false,
    }
}

pub fn can_view(dataset: &Dataset, caller: &Principal) -> bool {
    can_analyze(dataset, caller)
}

/// Owner or admin
pub fn can_delete(dataset: &Dataset, user: &User) -> bool {
    user.is_admin || is_owner(dataset, user)
}

pub fn can_publish(user: &User) -> bool {
    user.is_admin
}

pub fn ensure_can_analyze(dataset: &Dataset, caller: &Principal) -> ServiceResult<()> {
    if can_analyze(dataset, caller) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "Access denied. You can only analyze your own or public datasets.".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: i64, is_admin: bool) -> User {
        User {
            id,
            username: format!("user{}", id),
            email: format!("user{}@example.org", id),
            hashed_password: String::new(),
            is_admin,
            is_email_verified: true,
            email_verification_token: None,
            email_verification_expires: None,
            password_reset_token: None,
            password_reset_expires: None,
            created_at: Utc::now(),
        }
    }

    fn dataset(owner: Option<i64>, is_public: bool) -> Dataset {
        Dataset {
            id: 7,
            filename: "sample.h5ad".into(),
            file_path: "uploads/1/sample.h5ad".into(),
            dataset_name: "Sample".into(),
            csv_file_path: None,
            umap_csv_path: None,
            tissue_info: "Brain".into(),
            description: None,
            upload_time: Utc::now(),
            is_public,
            is_atlas: false,
            owner_id: owner,
        }
    }

    #[test]
    fn test_private_dataset_only_for_owner() {
        let private = dataset(Some(1), false);
        assert!(can_analyze(&private, &Principal::User(user(1, false))));
        assert!(!can_analyze(&private, &Principal::User(user(2, false))));
        assert!(!can_analyze(&private, &Principal::System));
        assert!(matches!(
            ensure_can_analyze(&private, &Principal::User(user(2, false))),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn test_public_dataset_open_to_all() {
        let public = dataset(Some(1), true);
        assert!(can_analyze(&public, &Principal::User(user(2, false))));
        assert!(can_analyze(&public, &Principal::System));
    }

    #[test]
    fn test_admin_is_not_an_implicit_analyzer() {
        let private = dataset(Some(1), false);
        assert!(!can_analyze(&private, &Principal::User(user(9, true))));
        assert!(can_delete(&private, &user(9, true)));
    }

    #[test]
    fn test_delete_and_publish_rules() {
        let ds = dataset(Some(1), false);
        assert!(can_delete(&ds, &user(1, false)));
        assert!(!can_delete(&ds, &user(2, false)));
        assert!(can_publish(&user(3, true)));
        assert!(!can_publish(&user(3, false)));
    }
}
