use once_cell::sync::Lazy;
use rocket::serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewOwnProgress,
    CompleteItems,
    SubmitAssessments,
    PostDiscussions,
    ViewOwnGrades,

    ViewClassProgress,
    ManageModules,
    ManageAssessments,
    GradeSubmissions,
    ViewClassGrades,
    ManageEnrollments,

    ManageCourses,
    ManageClasses,
    RegisterUsers,
    EditUserRoles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Student,
    Professor,
    Admin,
}

static STUDENT_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProgress);
    permissions.insert(Permission::CompleteItems);
    permissions.insert(Permission::SubmitAssessments);
    permissions.insert(Permission::PostDiscussions);
    permissions.insert(Permission::ViewOwnGrades);

    permissions
});

// Professors don't complete items or submit work themselves.
static PROFESSOR_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::PostDiscussions);

    permissions.insert(Permission::ViewClassProgress);
    permissions.insert(Permission::ManageModules);
    permissions.insert(Permission::ManageAssessments);
    permissions.insert(Permission::GradeSubmissions);
    permissions.insert(Permission::ViewClassGrades);
    permissions.insert(Permission::ManageEnrollments);

    permissions
});

static ADMIN_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(PROFESSOR_PERMISSIONS.iter().copied());

    permissions.insert(Permission::ManageCourses);
    permissions.insert(Permission::ManageClasses);
    permissions.insert(Permission::RegisterUsers);
    permissions.insert(Permission::EditUserRoles);

    permissions
});

impl Role {
    pub fn permissions(&self) -> &'static HashSet<Permission> {
        match self {
            Role::Student => &STUDENT_PERMISSIONS,
            Role::Professor => &PROFESSOR_PERMISSIONS,
            Role::Admin => &ADMIN_PERMISSIONS,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Professor => "professor",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "professor" => Ok(Role::Professor),
            "admin" => Ok(Role::Admin),
            _ => Err(AppError::Validation(format!("Unknown role: {}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
