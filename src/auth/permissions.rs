use anyhow::Error;
use once_cell::sync::Lazy;
use rocket::serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewOwnProfile,
    EditOwnProfile,

    ViewAssignedWork,
    UpdateWorkStatus,
    ReviewSubmissions,
    PostChatMessages,
    ViewNotifications,

    ViewDashboard,
    CreateAssignments,
    EditOwnAssignments,
    DeleteOwnAssignments,
    ManageFieldSchema,
    ProvisionUsers,
    DeleteProvisionedUsers,

    ManageAllAssignments,
    ManageCategories,
    DeleteAnyUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Student,
    Teacher,
    Subscriber,
    Admin,
}

static STUDENT_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProfile);
    permissions.insert(Permission::EditOwnProfile);
    permissions.insert(Permission::ViewAssignedWork);
    permissions.insert(Permission::UpdateWorkStatus);
    permissions.insert(Permission::PostChatMessages);
    permissions.insert(Permission::ViewNotifications);

    permissions
});

static TEACHER_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProfile);
    permissions.insert(Permission::EditOwnProfile);
    permissions.insert(Permission::ViewAssignedWork);
    permissions.insert(Permission::ReviewSubmissions);
    permissions.insert(Permission::PostChatMessages);
    permissions.insert(Permission::ViewNotifications);

    permissions
});

static SUBSCRIBER_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProfile);
    permissions.insert(Permission::EditOwnProfile);
    permissions.insert(Permission::PostChatMessages);
    permissions.insert(Permission::ViewNotifications);

    permissions.insert(Permission::ViewDashboard);
    permissions.insert(Permission::CreateAssignments);
    permissions.insert(Permission::EditOwnAssignments);
    permissions.insert(Permission::DeleteOwnAssignments);
    permissions.insert(Permission::ManageFieldSchema);
    permissions.insert(Permission::ProvisionUsers);
    permissions.insert(Permission::DeleteProvisionedUsers);

    permissions
});

static ADMIN_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(STUDENT_PERMISSIONS.iter().copied());
    permissions.extend(TEACHER_PERMISSIONS.iter().copied());
    permissions.extend(SUBSCRIBER_PERMISSIONS.iter().copied());

    permissions.insert(Permission::ManageAllAssignments);
    permissions.insert(Permission::ManageCategories);
    permissions.insert(Permission::DeleteAnyUser);

    permissions
});

impl Role {
    pub fn permissions(&self) -> &'static HashSet<Permission> {
        match self {
            Role::Student => &STUDENT_PERMISSIONS,
            Role::Teacher => &TEACHER_PERMISSIONS,
            Role::Subscriber => &SUBSCRIBER_PERMISSIONS,
            Role::Admin => &ADMIN_PERMISSIONS,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Subscriber => "subscriber",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "subscriber" => Ok(Role::Subscriber),
            "admin" => Ok(Role::Admin),
            _ => Err(Error::msg(format!("Unknown role: {}", s))),
        }
    }

    /// Roles a subscriber may hand out when provisioning accounts. Anything
    /// else submitted is forced to the default.
    pub fn provisionable(s: &str) -> Role {
        match s {
            "teacher" => Role::Teacher,
            _ => Role::Student,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
