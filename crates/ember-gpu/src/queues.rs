//! Queue family allocation.
//!
//! Partitions the queue families of the selected device across the graphics,
//! present, compute and transfer roles. The search is greedy and works on
//! probed properties only, so it can run before any logical device exists.

use ash::vk;
use std::fmt;

use crate::error::{GpuError, Result};

/// Role a queue plays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Compute,
    Transfer,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Graphics => "graphics",
            Self::Present => "present",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// Filter for [`find_queue_families`].
#[derive(Debug, Clone, Copy)]
pub struct QueueCriteria<'a> {
    /// Flags the family must carry.
    pub required: vk::QueueFlags,
    /// Flags the family must not carry.
    pub forbidden: vk::QueueFlags,
    /// Per-family present support; `None` ignores presentation.
    pub present_support: Option<&'a [bool]>,
}

impl<'a> QueueCriteria<'a> {
    /// Families carrying `required`.
    pub fn requiring(required: vk::QueueFlags) -> Self {
        Self {
            required,
            forbidden: vk::QueueFlags::empty(),
            present_support: None,
        }
    }

    /// Additionally exclude families carrying any of `forbidden`.
    pub fn forbidding(mut self, forbidden: vk::QueueFlags) -> Self {
        self.forbidden = forbidden;
        self
    }

    /// Additionally require presentation support when `support` is given.
    pub fn presenting(mut self, support: Option<&'a [bool]>) -> Self {
        self.present_support = support;
        self
    }

    fn matches(&self, index: usize, family: &vk::QueueFamilyProperties) -> bool {
        family.queue_count > 0
            && family.queue_flags.contains(self.required)
            && !family.queue_flags.intersects(self.forbidden)
            && self
                .present_support
                .map_or(true, |support| support.get(index).copied().unwrap_or(false))
    }
}

/// Indices of all families matching `criteria`, in family order.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    criteria: QueueCriteria<'_>,
) -> Vec<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(index, family)| criteria.matches(*index, family))
        .map(|(index, _)| index as u32)
        .collect()
}

/// How a resource touched by two queue families is shared between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPlan {
    /// Both roles live on one family.
    Exclusive,
    /// Concurrent access across exactly these two families.
    Concurrent([u32; 2]),
}

impl SharingPlan {
    /// Plan for a resource used from families `a` and `b`.
    pub fn between(a: u32, b: u32) -> Self {
        if a == b {
            Self::Exclusive
        } else {
            Self::Concurrent([a, b])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            Self::Exclusive => vk::SharingMode::EXCLUSIVE,
            Self::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    /// Family indices to list in the create info; empty when exclusive.
    pub fn families(&self) -> &[u32] {
        match self {
            Self::Exclusive => &[],
            Self::Concurrent(families) => families,
        }
    }
}

/// One queue to create on the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCreatePlan {
    pub family: u32,
    pub count: u32,
}

/// Result of queue family allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAllocation {
    pub graphics: u32,
    pub present: u32,
    pub compute: u32,
    pub transfer: u32,
    /// One entry per distinct family, in first-use order.
    pub create_plans: Vec<QueueCreatePlan>,
}

impl QueueAllocation {
    /// Family index serving `role`.
    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
        }
    }

    /// Whether transfer runs on its own family.
    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }

    /// Sharing for buffers used by both graphics and transfer.
    pub fn transfer_sharing(&self) -> SharingPlan {
        SharingPlan::between(self.graphics, self.transfer)
    }

    /// Sharing for swapchain images rendered on graphics and presented on present.
    pub fn present_sharing(&self) -> SharingPlan {
        SharingPlan::between(self.graphics, self.present)
    }

    /// Vulkan queue create infos for [`Self::create_plans`].
    pub fn queue_create_infos<'a>(&self, priorities: &'a [f32]) -> Vec<vk::DeviceQueueCreateInfo<'a>> {
        self.create_plans
            .iter()
            .map(|plan| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(plan.family)
                    .queue_priorities(&priorities[..plan.count as usize])
            })
            .collect()
    }
}

/// Assign queue families to roles.
///
/// `present_support` is indexed by family; pass `None` for a headless session,
/// in which case presentation rides on the graphics family.
pub fn allocate_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: Option<&[bool]>,
) -> Result<QueueAllocation> {
    let graphics_compute = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    let everything = find_queue_families(
        families,
        QueueCriteria::requiring(graphics_compute).presenting(present_support),
    );

    let (graphics, present, compute) = if let Some(&family) = everything.first() {
        (family, family, family)
    } else {
        let graphics_present = find_queue_families(
            families,
            QueueCriteria::requiring(vk::QueueFlags::GRAPHICS).presenting(present_support),
        );

        if let Some(&family) = graphics_present.first() {
            let compute_only = find_queue_families(
                families,
                QueueCriteria::requiring(vk::QueueFlags::COMPUTE).forbidding(vk::QueueFlags::GRAPHICS),
            );
            let compute = *compute_only
                .first()
                .ok_or(GpuError::NoQueueFamily(QueueRole::Compute))?;
            (family, family, compute)
        } else {
            let graphics = *find_queue_families(
                families,
                QueueCriteria::requiring(vk::QueueFlags::GRAPHICS),
            )
            .first()
            .ok_or(GpuError::NoQueueFamily(QueueRole::Graphics))?;

            let present = *find_queue_families(
                families,
                QueueCriteria::requiring(vk::QueueFlags::empty()).presenting(present_support),
            )
            .first()
            .ok_or(GpuError::NoQueueFamily(QueueRole::Present))?;

            let compute = *find_queue_families(
                families,
                QueueCriteria::requiring(vk::QueueFlags::COMPUTE),
            )
            .first()
            .ok_or(GpuError::NoQueueFamily(QueueRole::Compute))?;

            (graphics, present, compute)
        }
    };

    let transfer = find_queue_families(
        families,
        QueueCriteria::requiring(vk::QueueFlags::TRANSFER).forbidding(graphics_compute),
    )
    .first()
    .copied()
    .unwrap_or(graphics);

    let mut create_plans: Vec<QueueCreatePlan> = Vec::new();
    for family in [graphics, present, compute, transfer] {
        if !create_plans.iter().any(|plan| plan.family == family) {
            create_plans.push(QueueCreatePlan { family, count: 1 });
        }
    }

    tracing::debug!(
        "Queue families: graphics={} present={} compute={} transfer={}",
        graphics,
        present,
        compute,
        transfer
    );

    Ok(QueueAllocation {
        graphics,
        present,
        compute,
        transfer,
        create_plans,
    })
}
