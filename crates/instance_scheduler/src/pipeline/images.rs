//! Image size reduction and sub-resource fault isolation.
//!
//! A bad image never fails an update: wrong sizes are replaced by black
//! placeholders and short mip chains are padded, both reported as warnings.

use rayon::prelude::*;

use crate::context::ImageRequest;
use crate::types::{black_level, mip_extent, Image, ImageDesc, ImageFormat, ImageKey};

/// Stand-in size for images whose recorded size is missing.
pub const PLACEHOLDER_DESC: ImageDesc = ImageDesc {
	width: 4,
	height: 4,
	mip_count: 1,
	format: ImageFormat::Rgba8,
};

/// What [`fix_image`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFix {
	None,
	/// Size or format mismatch; replaced with black.
	Placeholder,
	/// Mip chain was short; padded with black levels.
	PaddedMips,
}

/// Mips to drop so the largest edge fits `max_size` (0 = unlimited).
///
/// Halves per level, so the reduction is always a power of two. The last mip
/// is never dropped.
pub fn mips_to_skip(desc: &ImageDesc, max_size: u32) -> u32 {
	if max_size == 0 {
		return 0;
	}
	let largest = desc.width.max(desc.height);
	let mut skip = 0;
	while skip + 1 < desc.mip_count && mip_extent(largest, skip) > max_size {
		skip += 1;
	}
	skip
}

/// Size the engine should have produced for `request`.
pub fn expected_desc(request: &ImageRequest) -> ImageDesc {
	request
		.slot
		.desc
		.filter(ImageDesc::is_well_formed)
		.map(|desc| desc.reduced(request.mips_to_skip))
		.unwrap_or(PLACEHOLDER_DESC)
}

/// Check `image` against `expected`, repairing it if needed.
pub fn fix_image(image: Image, expected: &ImageDesc) -> (Image, ImageFix) {
	if !expected.is_well_formed() {
		tracing::warn!(
			key = image.key.0,
			expected = ?(expected.width, expected.height, expected.mip_count),
			"recorded image size is malformed; using a placeholder"
		);
		return (Image::black(image.key, &PLACEHOLDER_DESC), ImageFix::Placeholder);
	}
	if image.width != expected.width || image.height != expected.height || image.format != expected.format {
		tracing::warn!(
			key = image.key.0,
			got = ?(image.width, image.height, image.format),
			expected = ?(expected.width, expected.height, expected.format),
			"generated image has the wrong size; using a placeholder"
		);
		return (Image::black(image.key, expected), ImageFix::Placeholder);
	}

	let present = image.mip_count();
	if present >= expected.mip_count {
		return (image, ImageFix::None);
	}

	tracing::warn!(
		key = image.key.0,
		present,
		expected = expected.mip_count,
		"generated image is missing mips; padding with black"
	);
	let mut image = image;
	for level in present..expected.mip_count {
		image
			.mips
			.push(black_level(expected.width, expected.height, level, expected.format));
	}
	(image, ImageFix::PaddedMips)
}

/// Fix a batch of built images in parallel.
pub fn fix_images(built: Vec<(ImageRequest, Image)>) -> Vec<(Image, ImageFix)> {
	built
		.into_par_iter()
		.map(|(request, image)| fix_image(image, &expected_desc(&request)))
		.collect()
}

/// Placeholder for an image that could not be produced at all.
pub fn placeholder(key: ImageKey, expected: &ImageDesc) -> Image {
	Image::black(key, expected)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::ImageSlot;

	fn desc(size: u32, mips: u32) -> ImageDesc {
		ImageDesc {
			width: size,
			height: size,
			mip_count: mips,
			format: ImageFormat::Rgba8,
		}
	}

	#[test]
	fn test_mips_to_skip() {
		assert_eq!(mips_to_skip(&desc(1024, 11), 0), 0);
		assert_eq!(mips_to_skip(&desc(1024, 11), 1024), 0);
		assert_eq!(mips_to_skip(&desc(1024, 11), 512), 1);
		assert_eq!(mips_to_skip(&desc(1024, 11), 256), 2);
		// Never below the last level
		assert_eq!(mips_to_skip(&desc(1024, 2), 16), 1);
		assert_eq!(mips_to_skip(&desc(1 << 31, 40), 1), 31);
	}

	#[test]
	fn test_malformed_expected_size_becomes_placeholder() {
		let image = Image::black(ImageKey(1), &desc(8, 1));

		let (fixed, fix) = fix_image(image, &desc(4, 40));

		assert_eq!(fix, ImageFix::Placeholder);
		assert_eq!((fixed.width, fixed.height), (PLACEHOLDER_DESC.width, PLACEHOLDER_DESC.height));
		assert_eq!(fixed.mip_count(), PLACEHOLDER_DESC.mip_count);
	}

	#[test]
	fn test_malformed_slot_expects_placeholder_size() {
		let request = ImageRequest {
			slot: ImageSlot {
				key: ImageKey(2),
				desc: Some(desc(16, 33)),
			},
			mips_to_skip: 0,
		};
		assert_eq!(expected_desc(&request), PLACEHOLDER_DESC);
	}

	#[test]
	fn test_correct_image_untouched() {
		let image = Image::black(ImageKey(1), &desc(8, 4));
		let (fixed, fix) = fix_image(image.clone(), &desc(8, 4));
		assert_eq!(fix, ImageFix::None);
		assert_eq!(fixed, image);
	}

	#[test]
	fn test_wrong_size_becomes_placeholder() {
		let mut image = Image::black(ImageKey(1), &desc(16, 1));
		image.mips[0].fill(255);

		let (fixed, fix) = fix_image(image, &desc(8, 4));

		assert_eq!(fix, ImageFix::Placeholder);
		assert_eq!((fixed.width, fixed.height, fixed.mip_count()), (8, 8, 4));
		assert!(fixed.mips.iter().flatten().all(|&b| b == 0));
	}

	#[test]
	fn test_short_chain_is_padded() {
		let mut image = Image::black(ImageKey(1), &desc(8, 2));
		image.mips[0].fill(7);

		let (fixed, fix) = fix_image(image, &desc(8, 4));

		assert_eq!(fix, ImageFix::PaddedMips);
		assert_eq!(fixed.mip_count(), 4);
		// Existing data kept
		assert!(fixed.mips[0].iter().all(|&b| b == 7));
		assert_eq!(fixed.mips[3].len(), 4);
	}

	#[test]
	fn test_fix_images_batch() {
		let request = |size| ImageRequest {
			slot: ImageSlot {
				key: ImageKey(size as u64),
				desc: Some(desc(size, 1)),
			},
			mips_to_skip: 0,
		};
		let built = vec![
			(request(4), Image::black(ImageKey(4), &desc(4, 1))),
			(request(8), Image::black(ImageKey(8), &desc(2, 1))),
		];

		let fixes: Vec<_> = fix_images(built).into_iter().map(|(_, f)| f).collect();
		assert_eq!(fixes, vec![ImageFix::None, ImageFix::Placeholder]);
	}
}
