//! Queue-family role resolution
//!
//! Picks one family per role from the physical device's family list. Roles may
//! land on the same family; each role stays independently addressable.

use ash::vk;
use bitflags::bitflags;

use crate::error::{VulkanError, VulkanResult};

/// Work category a queue is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueRole {
    /// Rendering and everything else
    Graphics,
    /// Simulation/update dispatches
    Compute,
    /// Uploads and buffer/image copies
    Transfer,
    /// Swap-chain presentation
    Present,
}

impl QueueRole {
    /// All roles in resolution order
    pub const ALL: [Self; 4] = [Self::Graphics, Self::Compute, Self::Transfer, Self::Present];

    /// Bit for this role inside [`QueueRoles`]
    pub const fn flag(self) -> QueueRoles {
        match self {
            Self::Graphics => QueueRoles::GRAPHICS,
            Self::Compute => QueueRoles::COMPUTE,
            Self::Transfer => QueueRoles::TRANSFER,
            Self::Present => QueueRoles::PRESENT,
        }
    }

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
            Self::Present => 3,
        }
    }
}

bitflags! {
    /// Set of roles served by one queue family
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueRoles: u8 {
        /// Serves the graphics role
        const GRAPHICS = 1 << 0;
        /// Serves the compute role
        const COMPUTE = 1 << 1;
        /// Serves the transfer role
        const TRANSFER = 1 << 2;
        /// Serves the present role
        const PRESENT = 1 << 3;
    }
}

/// Knobs for [`QueueFamilies::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyPreferences {
    /// Prefer COMPUTE without GRAPHICS
    pub dedicated_compute: bool,
    /// Prefer TRANSFER without GRAPHICS or COMPUTE
    pub dedicated_transfer: bool,
}

impl Default for FamilyPreferences {
    fn default() -> Self {
        Self {
            dedicated_compute: true,
            dedicated_transfer: true,
        }
    }
}

/// Resolved family index per role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    indices: [u32; 4],
}

impl QueueFamilies {
    /// Resolve a family for every role.
    ///
    /// `supports_present` is asked per family index; pass `|_| Ok(false)` for
    /// headless use, in which case presentation aliases the graphics family.
    pub fn resolve<F>(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: F,
        headless: bool,
        prefs: FamilyPreferences,
    ) -> VulkanResult<Self>
    where
        F: FnMut(u32) -> VulkanResult<bool>,
    {
        let find = |predicate: &dyn Fn(vk::QueueFlags) -> bool| {
            families
                .iter()
                .position(|family| family.queue_count > 0 && predicate(family.queue_flags))
                .map(|index| index as u32)
        };

        let graphics = find(&|flags| flags.contains(vk::QueueFlags::GRAPHICS)).ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;

        let dedicated_compute = if prefs.dedicated_compute {
            find(&|flags| {
                flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
            })
        } else {
            None
        };
        let compute = dedicated_compute
            .or_else(|| find(&|flags| flags.contains(vk::QueueFlags::COMPUTE)))
            .ok_or_else(|| {
                VulkanError::InitializationFailed("No compute queue family found".to_string())
            })?;

        let dedicated_transfer = if prefs.dedicated_transfer {
            find(&|flags| {
                flags.contains(vk::QueueFlags::TRANSFER)
                    && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
        } else {
            None
        };
        // Graphics families implicitly support transfer operations
        let transfer = dedicated_transfer.unwrap_or(graphics);

        let present = if headless {
            graphics
        } else if supports_present(graphics)? {
            graphics
        } else {
            let mut found = None;
            for index in 0..families.len() as u32 {
                if families[index as usize].queue_count > 0 && supports_present(index)? {
                    found = Some(index);
                    break;
                }
            }
            found.ok_or_else(|| {
                VulkanError::InitializationFailed("No present queue family found".to_string())
            })?
        };

        Ok(Self {
            indices: [graphics, compute, transfer, present],
        })
    }

    /// Build directly from known indices
    pub const fn from_indices(graphics: u32, compute: u32, transfer: u32, present: u32) -> Self {
        Self {
            indices: [graphics, compute, transfer, present],
        }
    }

    /// Family index resolved for `role`
    pub const fn index_of(&self, role: QueueRole) -> u32 {
        self.indices[role.slot()]
    }

    /// Unique family indices in ascending order
    pub fn distinct(&self) -> Vec<u32> {
        let mut unique = self.indices.to_vec();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Roles that resolved to `family`
    pub fn roles_of(&self, family: u32) -> QueueRoles {
        QueueRole::ALL
            .iter()
            .filter(|role| self.index_of(**role) == family)
            .fold(QueueRoles::empty(), |roles, role| roles | role.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D { width: 1, height: 1, depth: 1 },
        }
    }

    fn discrete_layout() -> Vec<vk::QueueFamilyProperties> {
        vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ]
    }

    #[test]
    fn test_dedicated_families_selected() {
        let families = QueueFamilies::resolve(
            &discrete_layout(),
            |index| Ok(index == 0),
            false,
            FamilyPreferences::default(),
        )
        .unwrap();

        assert_eq!(families.index_of(QueueRole::Graphics), 0);
        assert_eq!(families.index_of(QueueRole::Compute), 2);
        assert_eq!(families.index_of(QueueRole::Transfer), 1);
        assert_eq!(families.index_of(QueueRole::Present), 0);
        assert_eq!(families.distinct(), vec![0, 1, 2]);
    }

    #[test]
    fn test_no_preference_aliases_graphics() {
        let families = QueueFamilies::resolve(
            &discrete_layout(),
            |_| Ok(false),
            true,
            FamilyPreferences {
                dedicated_compute: false,
                dedicated_transfer: false,
            },
        )
        .unwrap();

        assert_eq!(families.distinct(), vec![0]);
        assert_eq!(families.roles_of(0), QueueRoles::all());
        assert_eq!(families.roles_of(1), QueueRoles::empty());
    }

    #[test]
    fn test_single_family_device() {
        let families = QueueFamilies::resolve(
            &[family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)],
            |_| Ok(true),
            false,
            FamilyPreferences::default(),
        )
        .unwrap();

        for role in QueueRole::ALL {
            assert_eq!(families.index_of(role), 0);
        }
    }

    #[test]
    fn test_present_falls_back_to_other_family() {
        let families = QueueFamilies::resolve(
            &discrete_layout(),
            |index| Ok(index == 2),
            false,
            FamilyPreferences::default(),
        )
        .unwrap();

        assert_eq!(families.index_of(QueueRole::Present), 2);
        assert_eq!(families.roles_of(2), QueueRoles::COMPUTE | QueueRoles::PRESENT);
    }

    #[test]
    fn test_missing_graphics_is_error() {
        let result = QueueFamilies::resolve(
            &[family(vk::QueueFlags::COMPUTE)],
            |_| Ok(true),
            false,
            FamilyPreferences::default(),
        );
        assert!(matches!(result, Err(VulkanError::InitializationFailed(_))));
    }

    #[test]
    fn test_no_presentable_family_is_error() {
        let result = QueueFamilies::resolve(
            &discrete_layout(),
            |_| Ok(false),
            false,
            FamilyPreferences::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_family_skipped() {
        let mut families = discrete_layout();
        families[1].queue_count = 0;
        let resolved = QueueFamilies::resolve(&families, |_| Ok(false), true, FamilyPreferences::default())
            .unwrap();
        assert_eq!(resolved.index_of(QueueRole::Transfer), 0);
    }

    #[test]
    fn test_present_query_errors_propagate() {
        let result = QueueFamilies::resolve(
            &discrete_layout(),
            |_| Err(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR)),
            false,
            FamilyPreferences::default(),
        );
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_SURFACE_LOST_KHR))));
    }
}
